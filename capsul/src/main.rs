mod cli;
mod compiler;
mod conf;
mod engine;
mod storage;

#[tokio::main]
async fn main() {
    cli::init().await;
}
