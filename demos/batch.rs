use std::error::Error;

use action_monitor_client::{EventListenerClient, EventType};
use tokio::sync::mpsc;

fn main() -> Result<(), Box<dyn Error>> {
    let addr = "127.0.0.1:8888".to_string();
    let topics = [EventType(1), EventType(2), EventType(3)];

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let listener = EventListenerClient::new(addr).spawn(Some(events_tx))?;

        let mut state = listener.state_changes();
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                println!("state={:?}", *state.borrow_and_update());
            }
        });

        listener.batch_subscribe(&topics, 0).await?;

        while let Some(message) = tokio::select! {
            _ = tokio::signal::ctrl_c() => None,
            message = events_rx.recv() => message,
        } {
            println!("batch offset={} events={}", message.offset, message.events.len());
            for (topic, offset) in listener.subscriptions() {
                println!("  {topic} resumes at {offset}");
            }
        }

        listener.batch_unsubscribe(&topics).await?;
        listener.close();
        Ok::<(), Box<dyn Error>>(())
    })
}
