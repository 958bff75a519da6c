use crate::chat::Session;
use crate::events::{emit, EventStarted};
use std::net::SocketAddr;
use std::time::Instant;
use tcpchat_transport::ChatNode;

pub async fn run(
    mut node: ChatNode,
    name: &str,
    target: SocketAddr,
    start: Instant,
) -> anyhow::Result<()> {
    emit(&EventStarted::new(name, "connect", None));
    eprintln!("Connecting as {name} to {target}...");

    let connection = match node.connect(target).await {
        Ok(connection) => connection,
        Err(e) => {
            let recoverable = e.is_recoverable();
            node.shutdown().await?;
            if recoverable {
                anyhow::bail!("{target} is unreachable right now, try again later: {e}");
            }
            return Err(e.into());
        }
    };
    eprintln!("Type a line to send it. Press Ctrl+C to stop.\n");

    let mut session = Session::new("connect", name, start).exit_when_idle(true);
    session.adopt(connection, target).await;
    session.run(node).await
}
