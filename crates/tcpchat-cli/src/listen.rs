use crate::chat::Session;
use crate::events::{emit, EventStarted};
use std::time::Instant;
use tcpchat_transport::ChatNode;

pub async fn run(mut node: ChatNode, name: &str, start: Instant) -> anyhow::Result<()> {
    let endpoint = node.create_server().await?;

    emit(&EventStarted::new(name, "listen", Some(endpoint.to_string())));
    eprintln!("Listening as {name} on {endpoint}");
    eprintln!("Type a line to send it to every peer. Press Ctrl+C to stop.\n");

    Session::new("listen", name, start).run(node).await
}
