use mongo_runner::config::RunnerConfig;
use mongo_runner::context::{ConfirmPolicy, ExecutionContext};
use mongo_runner::error::Result;
use mongo_runner::model::{Cluster, Member, Server};
use mongo_runner::repository::InMemoryRepository;
use mongo_runner::server::{StartOptions, StopOptions};
use mongo_runner::MongoRunner;
use tracing_subscriber::{EnvFilter, fmt};

fn member_server(id: &str, port: u16, root: &std::path::Path) -> Server {
    let mut server = Server::new(id, root.join(id));
    server.address = Some(format!("localhost:{}", port));
    server.options.port = Some(port);
    server
}

#[tokio::main]
async fn main() {
    let mut context = ExecutionContext::new().with_confirm(ConfirmPolicy::AcceptAll);
    context.verbose = std::env::args().any(|arg| arg == "-v" || arg == "--verbose");

    // RUST_LOG wins; otherwise verbose runs log at debug level
    let default_level = if context.verbose { "debug" } else { "info" };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(true)
        .init();

    if let Err(e) = run(context).await {
        eprintln!("Error: {}", e);
        let mut source = std::error::Error::source(&e);
        while let Some(cause) = source {
            eprintln!("  Caused by: {}", cause);
            source = cause.source();
        }
        std::process::exit(1);
    }
}

async fn run(context: ExecutionContext) -> Result<()> {
    tracing::info!("Starting start_replica_set demo");

    let root = std::env::temp_dir().join("mongo-runner-demo");
    let repository = InMemoryRepository::new()
        .with_server(member_server("demo-a", 28017, &root))
        .with_server(member_server("demo-b", 28018, &root))
        .with_cluster(Cluster {
            id: "demo-rs".to_string(),
            description: Some("Two member demo replica set".to_string()),
            members: vec![Member::for_server("demo-a"), Member::for_server("demo-b")],
            repl_key: None,
        });

    let runner =
        MongoRunner::new(RunnerConfig::default().with_env_overrides(), repository).with_context(context);

    println!("Starting demo-a (initializes the replica set)...");
    runner.start_server("demo-a", &StartOptions::default()).await?;

    println!("Starting demo-b (joins the replica set)...");
    let join = StartOptions {
        add_to_replica_set: true,
        ..StartOptions::default()
    };
    runner.start_server("demo-b", &join).await?;

    for id in ["demo-a", "demo-b"] {
        let status = runner.server_status(id).await?;
        println!("{} is {} (pid {:?})", id, status.state, status.pid);
    }

    println!("Stopping both servers...");
    let stop = StopOptions {
        force: true,
        step_down: true,
    };
    runner.stop_server("demo-b", &stop).await?;
    runner.stop_server("demo-a", &stop).await?;

    Ok(())
}
