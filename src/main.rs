use blitzd::actors::RootActor;
use blitzd::tasks::{
    cancel_tasks_and_wait_for_completion, new_tokio_cancellation_token, new_tokio_task_tracker,
};
use blitzd::{start_node, Config, Store};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

pub struct ExitMessage(String);

impl std::fmt::Debug for ExitMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[tokio::main]
pub async fn main() -> Result<(), ExitMessage> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .map_err(|err| ExitMessage(format!("failed to initialize logger: {}", err)))?;

    let config = Config::parse();

    std::fs::create_dir_all(config.node.store_path().parent().expect("store dir"))
        .map_err(|err| ExitMessage(format!("failed to create base dir: {}", err)))?;
    let store = Store::new(config.node.store_path())
        .map_err(|err| ExitMessage(format!("failed to open store: {}", err)))?;

    let tracker = new_tokio_task_tracker();
    let token = new_tokio_cancellation_token();
    let root_actor = RootActor::start(tracker, token).await;

    let _network_actor = start_node(config.node, store, root_actor.get_cell()).await;

    info!("node started; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|err| ExitMessage(format!("failed to wait for ctrl-c: {}", err)))?;

    info!("shutting down");
    cancel_tasks_and_wait_for_completion().await;
    Ok(())
}
