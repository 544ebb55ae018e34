//! Live smoke test against a real homeserver, driven by environment
//! variables: `WEFT_HOMESERVER`, `WEFT_USER`, `WEFT_PASSWORD`, and
//! optionally `WEFT_SMOKE_TARGET`/`WEFT_SMOKE_BODY` to send a message.

use std::env;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use weft_client::Client;

const DEFAULT_FILTER: &str = "info,weft_client=debug";

/// Initialize tracing with severity gating from the environment.
///
/// Precedence: `RUST_LOG`, then `WEFT_LOG`, then the internal default.
fn init_logging() {
    let filter = if let Ok(filter) = EnvFilter::try_from_default_env() {
        filter
    } else if let Some(value) = env::var("WEFT_LOG").ok().filter(|v| !v.trim().is_empty())
        && let Ok(filter) = EnvFilter::try_new(value)
    {
        filter
    } else {
        EnvFilter::new(DEFAULT_FILTER)
    };

    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(filter)
        .try_init();
}

#[tokio::main]
async fn main() {
    init_logging();

    let homeserver =
        env::var("WEFT_HOMESERVER").unwrap_or_else(|_| "https://matrix.example.org".to_owned());
    let client = match Client::new(&homeserver) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("failed to initialize client: {err}");
            std::process::exit(1);
        }
    };

    let (Some(user), Some(password)) = (env::var("WEFT_USER").ok(), env::var("WEFT_PASSWORD").ok())
    else {
        println!("Set WEFT_USER and WEFT_PASSWORD to run the live smoke.");
        println!("Optional: set WEFT_SMOKE_TARGET to send a text message.");
        return;
    };

    client
        .password_login(&user, &password, Some("Weft Smoke"), None)
        .await
        .expect("live login failed");
    info!(user = %user, "login successful");

    client
        .sync(Duration::from_secs(10))
        .await
        .expect("sync failed");
    let rooms = client.joined_room_ids().expect("room list failed");
    println!("Synced {} joined room(s):", rooms.len());
    for room in &rooms {
        println!("  {room}");
    }

    if let Some(target) = env::var("WEFT_SMOKE_TARGET").ok() {
        let body =
            env::var("WEFT_SMOKE_BODY").unwrap_or_else(|_| "weft client smoke test".to_owned());
        let event_id = client
            .send_text_message(&target.as_str().into(), &body)
            .await
            .expect("send failed");
        println!("Sent message to {target} as event {event_id}");
    }
}
