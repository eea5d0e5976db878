use std::error::Error;
use std::time::Duration;

use action_monitor_client::{EventListenerClient, ListenerConfig};
use tokio::sync::mpsc;

fn main() -> Result<(), Box<dyn Error>> {
    let addr = "127.0.0.1:8888".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let config = ListenerConfig::default().with_reconnection(Duration::from_secs(2), 10);
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let listener = EventListenerClient::new(addr)
            .with_config(config)
            .start(Some(events_tx))
            .await?;

        if !listener.subscribe(1, 0).await? {
            eprintln!("server declined subscription to event_1");
        }

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                message = events_rx.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    for event in &message.events {
                        println!(
                            "offset={} type={} sender={} game_id={} data={}",
                            event.offset,
                            event.event_type,
                            event.sender,
                            event.game_id,
                            event.data_json().unwrap_or("null"),
                        );
                    }
                }
            }
        }

        listener.close();
        listener.closed().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
