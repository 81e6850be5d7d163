//! Process and schema resolution by string identifier (spec.md §9
//! "Executable loading by string"). Deliberately not a singleton
//! application object: two explicit, lazily-initialized registries,
//! populated once at static-init time via [`register_process`]/
//! [`register_schema`] or the [`register_processes`] convenience macro.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::dataset::MetadataSchema;
use crate::process::ProcessDefinition;

type ProcessMap = HashMap<String, Arc<dyn ProcessDefinition>>;
type SchemaMap = HashMap<String, Arc<dyn MetadataSchema>>;

static PROCESS_REGISTRY: OnceLock<RwLock<ProcessMap>> = OnceLock::new();
static SCHEMA_REGISTRY: OnceLock<RwLock<SchemaMap>> = OnceLock::new();

fn process_registry() -> &'static RwLock<ProcessMap> {
    PROCESS_REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn schema_registry() -> &'static RwLock<SchemaMap> {
    SCHEMA_REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

pub fn register_process(definition: Arc<dyn ProcessDefinition>) {
    let id = definition.definition_id().to_string();
    process_registry()
        .write()
        .expect("process registry lock poisoned")
        .insert(id, definition);
}

pub fn resolve_process(definition_id: &str) -> Option<Arc<dyn ProcessDefinition>> {
    process_registry()
        .read()
        .expect("process registry lock poisoned")
        .get(definition_id)
        .cloned()
}

pub fn register_schema(schema: Arc<dyn MetadataSchema>) {
    let name = schema.name().to_string();
    schema_registry()
        .write()
        .expect("schema registry lock poisoned")
        .insert(name, schema);
}

pub fn resolve_schema(name: &str) -> Option<Arc<dyn MetadataSchema>> {
    schema_registry()
        .read()
        .expect("schema registry lock poisoned")
        .get(name)
        .cloned()
}
