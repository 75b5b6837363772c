use std::sync::Arc;
use std::time::Duration;

use lifecycle_dispatcher::{
    AccountId, InMemoryStore, NewCall, NewMessage, Resource, ResourceStore, Simulator,
    SimulatorConfig, WebhookQueue,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Point this at a local receiver to see real deliveries, e.g.
    // CALLBACK_URL=https://webhook.site/<id> cargo run --example simulate
    let callback = std::env::var("CALLBACK_URL")
        .unwrap_or_else(|_| "https://example.com/status".to_string());

    let store = Arc::new(InMemoryStore::new());
    let mut sim = Simulator::with_storage(SimulatorConfig::default(), store.clone(), store.clone());

    let account = AccountId::new("AC_demo");
    let token = store.get_or_create_account(&account).await?.auth_token;
    println!("account {account} token {token}");

    store
        .create_phone_number(&account, "+15550001111", Some("demo line"), Some(callback.as_str()))
        .await?;
    let destination = store
        .status_callback_for(&account, "+15550001111")
        .await?
        .unwrap_or_default();

    let message = store
        .create_message(
            &account,
            NewMessage {
                from: "+15550001111".into(),
                to: "+15550002222".into(),
                body: "Your code is 123456".into(),
                status_callback: None,
            },
        )
        .await?;
    let message = Resource::Message(message);
    sim.schedule_lifecycle(&message, &destination).await?;

    let call = store
        .create_call(
            &account,
            NewCall {
                from: "+15550001111".into(),
                to: "+15550003333".into(),
                status_callback: Some(callback.clone()),
            },
        )
        .await?;
    let call = Resource::Call(call);
    sim.schedule_lifecycle(&call, &callback).await?;

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        for resource in [&message, &call] {
            let current = store.get_resource(resource.id()).await?;
            println!("{} {}", current.id(), current.status());
            for entry in store.entries_for(resource.id()).await? {
                println!(
                    "  #{} {:<12} {:?} attempts={}",
                    entry.id, entry.resource_status, entry.status, entry.attempts
                );
            }
        }
    }

    sim.shutdown().await;
    Ok(())
}
