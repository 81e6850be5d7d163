//! Compiles a fully-activated pipeline with concrete parameter values
//! into a `Workflow` (job DAG) plus a `ParameterStore` (spec.md §4.5).

use std::collections::HashMap;

use capsul_sdk::controller::FieldValue;
use capsul_sdk::dag::Dag;
use capsul_sdk::node::Endpoint;
use capsul_sdk::pipeline::{NodeKind, Pipeline};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Ready,
    Submitted,
    Done,
    Failed,
    /// A job whose `wait_for` set can never become `done` because one of
    /// its (transitive) dependencies failed — never claimed (spec.md §7.4
    /// "dependent jobs ... cancelled implicitly").
    Cancelled,
}

/// One unit of subprocess work (spec.md §4.5 step 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub uuid: Uuid,
    /// The node path this job was compiled from, e.g. `"a.b"` for a
    /// nested process named `b` inside pipeline node `a`.
    pub node_path: String,
    pub command: Vec<String>,
    pub wait_for: Vec<Uuid>,
    pub status: JobStatus,
    /// The registered process this job's command came from, if any.
    /// Present for real process jobs so `claim` can rebuild `command`
    /// against the parameter store's latest (proxy-resolved) values
    /// instead of the compile-time snapshot baked into `command` above
    /// (spec.md §5 "writes to the parameter store performed by
    /// complete(A) are visible to any later claim of B"). Absent for
    /// synthetic map/reduce nodes and hand-built jobs, whose `command`
    /// is already final.
    pub definition_id: Option<String>,
    /// This job's parameter values as resolved (proxies followed) at
    /// `claim` time. Fed back into `complete` so a job's own output
    /// values are written into the persisted parameter store at its node
    /// path, making them visible to any job proxied onto them (spec.md
    /// §4.6 `complete` "store outputs into the parameter store"). Empty
    /// until claimed.
    #[serde(default)]
    pub resolved_parameters: HashMap<String, FieldValue>,
}

impl Job {
    pub fn new(command: Vec<String>, wait_for: Vec<Uuid>) -> Self {
        Job {
            uuid: Uuid::new_v4(),
            node_path: String::new(),
            command,
            wait_for,
            status: JobStatus::Ready,
            definition_id: None,
            resolved_parameters: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    pub jobs: Vec<Job>,
}

/// One parameter slot in the store: a concrete value, or a proxy
/// pointing at another slot that is the single source of truth (spec.md
/// §4.5 step 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ParameterSlot {
    Value(FieldValue),
    Proxy(String),
}

/// A tree of parameter slots mirroring compiled node paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterStore {
    slots: HashMap<String, ParameterSlot>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: &str, value: FieldValue) {
        self.slots.insert(path.to_string(), ParameterSlot::Value(value));
    }

    /// Installs `path` as a proxy onto `target` — both now resolve to
    /// the same underlying value.
    pub fn proxy(&mut self, path: &str, target: &str) {
        self.slots.insert(path.to_string(), ParameterSlot::Proxy(target.to_string()));
    }

    /// Follows proxy chains to the concrete value, if any.
    pub fn resolve(&self, path: &str) -> Option<FieldValue> {
        let mut current = path;
        let mut hops = 0;
        loop {
            hops += 1;
            if hops > self.slots.len() + 1 {
                return None; // defensive: a cyclic proxy chain should never occur
            }
            match self.slots.get(current)? {
                ParameterSlot::Value(v) => return Some(v.clone()),
                ParameterSlot::Proxy(target) => current = target,
            }
        }
    }

    /// Every field registered under node path `node_path`, resolved
    /// through any proxy so a linked input reflects its upstream job's
    /// latest written output rather than its compile-time value.
    pub fn resolve_node(&self, node_path: &str) -> HashMap<String, FieldValue> {
        let prefix = format!("{node_path}.");
        self.slots
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix).map(|field| (key.clone(), field.to_string())))
            .filter_map(|(key, field)| self.resolve(&key).map(|v| (field, v)))
            .collect()
    }
}

fn job_command(node: &capsul_sdk::pipeline::Node, parameters: &HashMap<String, FieldValue>) -> Option<Vec<String>> {
    match &node.kind {
        NodeKind::Process(spec) if spec.is_job => {
            capsul_sdk::registry::resolve_process(&spec.definition).and_then(|def| def.command(parameters))
        }
        _ => None,
    }
}

/// Job nodes compiled so far at this pipeline level, keyed by child node
/// name, so link-walking (step 3) can find both endpoints.
struct CompiledLevel {
    jobs_by_node: HashMap<String, Vec<Uuid>>,
    /// The store path prefix for each node compiled at this level, so the
    /// link walk can install a proxy from `dst.path.in` onto `src.path.out`.
    node_paths: HashMap<String, String>,
}

/// Follows a link's destination through any chain of transparent
/// connector nodes (switches) to the job-bearing `(node_name, plug_name)`
/// pairs it ultimately feeds (spec.md §4.5 step 1 `get_connections_through`).
fn resolve_through_switches(
    pipeline: &Pipeline,
    jobs_by_node: &HashMap<String, Vec<Uuid>>,
    endpoint: Endpoint,
    plug: String,
) -> Vec<(String, String)> {
    let Endpoint::Node(name) = &endpoint else {
        return Vec::new();
    };
    if jobs_by_node.contains_key(name) {
        return vec![(name.clone(), plug)];
    }
    let Some(node) = pipeline.nodes.get(name) else {
        return Vec::new();
    };
    if !node.is_transparent_connector() {
        return Vec::new();
    }

    let mut resolved = Vec::new();
    for (input_plug, output_plug) in pipeline.get_connections_through(name) {
        if input_plug != plug {
            continue;
        }
        for next in &pipeline.links {
            if next.source_node == Endpoint::Node(name.clone()) && next.source_plug == output_plug {
                resolved.extend(resolve_through_switches(
                    pipeline,
                    jobs_by_node,
                    next.dest_node.clone(),
                    next.dest_plug.clone(),
                ));
            }
        }
    }
    resolved
}

/// Compiles `pipeline` into a `Workflow`/`ParameterStore` pair.
pub struct WorkflowCompiler;

impl WorkflowCompiler {
    /// Walks the pipeline's activation-connected nodes (switches are
    /// transparent per `Node::is_transparent_connector`), creating one
    /// job per active process whose `is_job()` is true, wiring
    /// dependencies for every link between two job-bearing nodes, and
    /// expanding `ProcessIteration` nodes into sibling jobs plus
    /// synthetic map/reduce nodes (spec.md §4.5 steps 1,2,3,5,6).
    pub fn compile(pipeline: &Pipeline, path_prefix: &str) -> (Workflow, ParameterStore) {
        let mut workflow = Workflow::default();
        let mut store = ParameterStore::new();
        let mut level = CompiledLevel { jobs_by_node: HashMap::new(), node_paths: HashMap::new() };

        for (node_name, node) in &pipeline.nodes {
            if !node.enabled {
                continue;
            }
            let node_active = node.plugs.values().all(|p| p.activated || p.optional);
            if !node_active {
                continue;
            }

            let path = format!("{path_prefix}{node_name}");
            level.node_paths.insert(node_name.clone(), path.clone());
            let field_names: Vec<String> = node.controller.fields().map(|f| f.name.clone()).collect();
            for field_name in field_names {
                let value = node.controller.value(&field_name);
                store.set(&format!("{path}.{field_name}"), value);
            }

            match &node.kind {
                NodeKind::Process(spec) => {
                    let params: HashMap<String, FieldValue> = node
                        .controller
                        .fields()
                        .map(|f| (f.name.clone(), node.controller.value(&f.name)))
                        .collect();
                    if let Some(command) = job_command(node, &params) {
                        let mut job = Job::new(command, vec![]);
                        job.node_path = path.clone();
                        job.definition_id = Some(spec.definition.clone());
                        level.jobs_by_node.insert(node_name.clone(), vec![job.uuid]);
                        workflow.jobs.push(job);
                    }
                }
                NodeKind::Pipeline(inner) => {
                    let (inner_workflow, inner_store) = Self::compile(inner, &format!("{path}."));
                    let leaf_jobs: Vec<Uuid> = inner_workflow.jobs.iter().map(|j| j.uuid).collect();
                    level.jobs_by_node.insert(node_name.clone(), leaf_jobs);
                    workflow.jobs.extend(inner_workflow.jobs);
                    store.slots.extend(inner_store.slots);
                }
                NodeKind::Switch(_) => {
                    // Transparent connector: contributes no job of its own.
                    // Its active option's upstream/downstream jobs are
                    // linked directly by the link walk below, since
                    // `Node::is_transparent_connector` is true for switches.
                }
                NodeKind::ProcessIteration(iteration) => {
                    let params: HashMap<String, FieldValue> = node
                        .controller
                        .fields()
                        .map(|f| (f.name.clone(), node.controller.value(&f.name)))
                        .collect();
                    let size = iteration.iteration_size(&params).unwrap_or(0);

                    let map_job = Job::new(vec![], vec![]);
                    let reduce_job = Job::new(vec![], vec![]);
                    let mut expanded = Vec::with_capacity(size);

                    for i in 0..size {
                        let selected = iteration.select_iteration_index(&params, i);
                        let command = capsul_sdk::registry::resolve_process(&iteration.base_definition)
                            .and_then(|def| def.command(&selected))
                            .unwrap_or_default();
                        let mut job = Job::new(command, vec![map_job.uuid]);
                        job.node_path = format!("{path}[{i}]");
                        expanded.push(job.uuid);
                        workflow.jobs.push(job);
                    }

                    let mut reduce_job = reduce_job;
                    reduce_job.wait_for = expanded.clone();
                    let mut map_job = map_job;
                    map_job.node_path = format!("{path}_map");
                    reduce_job.node_path = format!("{path}_reduce");

                    let mut all_job_uuids = vec![map_job.uuid];
                    all_job_uuids.extend(expanded.iter().copied());
                    all_job_uuids.push(reduce_job.uuid);
                    level.jobs_by_node.insert(node_name.clone(), all_job_uuids);

                    workflow.jobs.push(map_job);
                    workflow.jobs.push(reduce_job);
                }
            }
        }

        // Step 3: links between two job-bearing nodes become dependencies,
        // following any chain of transparent connectors (switches) so a
        // dependency across `A.out -> switch -> B.in` still connects A to
        // B. Step 4: each such link also installs a proxy from the
        // downstream input onto the upstream output, so a worker-written
        // value is visible to a later `claim` of the downstream job
        // (spec.md §4.5 steps 3-4).
        let mut dag = Dag::new();
        for job in &workflow.jobs {
            let _ = dag.add_node(&job.uuid.to_string());
        }
        for link in &pipeline.links {
            let Endpoint::Node(src) = &link.source_node else {
                continue;
            };
            let (Some(src_jobs), Some(src_path)) = (level.jobs_by_node.get(src), level.node_paths.get(src)) else {
                continue;
            };

            let targets = resolve_through_switches(pipeline, &level.jobs_by_node, link.dest_node.clone(), link.dest_plug.clone());
            for (dst_node, dst_plug) in targets {
                let (Some(dst_jobs), Some(dst_path)) =
                    (level.jobs_by_node.get(&dst_node), level.node_paths.get(&dst_node))
                else {
                    continue;
                };

                store.proxy(&format!("{dst_path}.{dst_plug}"), &format!("{src_path}.{}", link.source_plug));

                for &src_uuid in src_jobs {
                    for &dst_uuid in dst_jobs {
                        if dag.add_edge(&src_uuid.to_string(), &dst_uuid.to_string()).is_ok() {
                            if let Some(job) = workflow.jobs.iter_mut().find(|j| j.uuid == dst_uuid) {
                                if !job.wait_for.contains(&src_uuid) {
                                    job.wait_for.push(src_uuid);
                                }
                            }
                        }
                    }
                }
            }
        }

        (workflow, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsul_sdk::controller::{Field, FieldType};
    use capsul_sdk::node::Link;
    use capsul_sdk::process::ProcessSpec;
    use indexmap::IndexMap;
    use std::sync::Arc;

    struct EchoProcess;
    impl capsul_sdk::process::ProcessDefinition for EchoProcess {
        fn definition_id(&self) -> &str {
            "test.echo"
        }
        fn command(&self, _parameters: &HashMap<String, FieldValue>) -> Option<Vec<String>> {
            Some(vec!["echo".to_string()])
        }
    }

    fn process_node(name: &str) -> capsul_sdk::pipeline::Node {
        let mut node = capsul_sdk::pipeline::Node::process(name, ProcessSpec::new("test.echo"));
        node.add_field(Field::new("out", FieldType::Str).output(true)).unwrap();
        node
    }

    #[test]
    fn disabled_node_contributes_no_job() {
        capsul_sdk::registry::register_process(Arc::new(EchoProcess));
        let mut pipeline = Pipeline::new();
        let mut node = process_node("a");
        node.enabled = false;
        pipeline.add_node(node).unwrap();
        let (workflow, _) = WorkflowCompiler::compile(&pipeline, "");
        assert!(workflow.jobs.is_empty());
    }

    /// Iterating over 2 subjects x 3 sessions x 3 normalizations (18
    /// combinations) must expand into 18 per-combination jobs plus one
    /// `_map` fan-out and one `_reduce` fan-in job, each expanded job
    /// waiting only on `_map` and `_reduce` waiting on all 18.
    #[test]
    fn process_iteration_expands_into_eighteen_jobs_with_map_and_reduce() {
        use capsul_sdk::process_iteration::ProcessIteration;

        capsul_sdk::registry::register_process(Arc::new(EchoProcess));

        let subjects = ["aleksander", "casimiro"];
        let sessions = ["m0", "m12", "m24"];
        let normalizations = ["none", "aims", "fakespm12"];
        let mut subject_list = Vec::new();
        let mut session_list = Vec::new();
        let mut normalization_list = Vec::new();
        for subject in subjects {
            for session in sessions {
                for normalization in normalizations {
                    subject_list.push(serde_json::json!(subject));
                    session_list.push(serde_json::json!(session));
                    normalization_list.push(serde_json::json!(normalization));
                }
            }
        }
        assert_eq!(subject_list.len(), 18);

        let iteration = ProcessIteration::new(
            "test.echo",
            vec!["subject".to_string(), "session".to_string(), "normalization".to_string()],
        );
        let mut node = capsul_sdk::pipeline::Node::process_iteration("morphologist", iteration);
        node.add_field(Field::new("subject", FieldType::List(Box::new(FieldType::Str)))).unwrap();
        node.add_field(Field::new("session", FieldType::List(Box::new(FieldType::Str)))).unwrap();
        node.add_field(Field::new("normalization", FieldType::List(Box::new(FieldType::Str)))).unwrap();
        node.controller.set_value("subject", FieldValue::Value(serde_json::Value::Array(subject_list))).unwrap();
        node.controller.set_value("session", FieldValue::Value(serde_json::Value::Array(session_list))).unwrap();
        node.controller
            .set_value("normalization", FieldValue::Value(serde_json::Value::Array(normalization_list)))
            .unwrap();

        let mut pipeline = Pipeline::new();
        pipeline.add_node(node).unwrap();

        let (workflow, _store) = WorkflowCompiler::compile(&pipeline, "");

        let map_job = workflow.jobs.iter().find(|j| j.node_path == "morphologist_map").unwrap();
        let reduce_job = workflow.jobs.iter().find(|j| j.node_path == "morphologist_reduce").unwrap();
        let each: Vec<&Job> = workflow.jobs.iter().filter(|j| j.node_path.starts_with("morphologist[")).collect();

        assert_eq!(each.len(), 18, "one job per subject/session/normalization combination");
        assert_eq!(workflow.jobs.len(), 20, "18 iterations plus one map and one reduce job");
        assert!(each.iter().all(|j| j.wait_for == vec![map_job.uuid]), "every iteration waits only on the map fan-out");
        let mut reduce_wait_for = reduce_job.wait_for.clone();
        reduce_wait_for.sort();
        let mut expected: Vec<Uuid> = each.iter().map(|j| j.uuid).collect();
        expected.sort();
        assert_eq!(reduce_wait_for, expected, "reduce waits on every expanded iteration job");
    }

    #[test]
    fn linked_processes_get_a_dependency() {
        capsul_sdk::registry::register_process(Arc::new(EchoProcess));
        let mut pipeline = Pipeline::new();
        pipeline.add_node(process_node("a")).unwrap();
        let mut b = capsul_sdk::pipeline::Node::process("b", ProcessSpec::new("test.echo"));
        b.add_field(Field::new("inp", FieldType::Str)).unwrap();
        pipeline.add_node(b).unwrap();
        let mut boundary = IndexMap::new();
        pipeline
            .add_link(&mut boundary, Link::new(Endpoint::Node("a".into()), "out", Endpoint::Node("b".into()), "inp"))
            .unwrap();
        pipeline.recompute_activation(&mut boundary);

        let (workflow, _) = WorkflowCompiler::compile(&pipeline, "");
        assert_eq!(workflow.jobs.len(), 2);
        let b_job = workflow.jobs.iter().find(|j| j.node_path == "b").unwrap();
        assert_eq!(b_job.wait_for.len(), 1);
    }
}
