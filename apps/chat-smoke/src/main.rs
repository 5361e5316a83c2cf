mod logging;

use std::{env, process, sync::Arc, time::Duration};

use chat_client::{ChatRuntimeConfig, spawn_runtime};
use chat_core::{ChatCommand, ChatEvent};
use chat_session::{InMemorySession, SessionUser};
use url::Url;

#[tokio::main]
async fn main() {
    logging::init();

    let api_url =
        env::var("LOTLINE_API_URL").unwrap_or_else(|_| "http://localhost:4000/api".to_owned());
    let gateway_url = env::var("LOTLINE_GATEWAY_URL")
        .unwrap_or_else(|_| "ws://localhost:4000/socket/websocket".to_owned());

    let rest_base_url = match Url::parse(&api_url) {
        Ok(url) => url,
        Err(err) => {
            eprintln!("Invalid LOTLINE_API_URL '{api_url}': {err}");
            process::exit(1);
        }
    };
    let gateway_url = match Url::parse(&gateway_url) {
        Ok(url) => url,
        Err(err) => {
            eprintln!("Invalid LOTLINE_GATEWAY_URL '{gateway_url}': {err}");
            process::exit(1);
        }
    };

    let session = match env::var("LOTLINE_TOKEN") {
        Ok(token) => {
            let id = env::var("LOTLINE_USER_ID").unwrap_or_else(|_| "smoke-user".to_owned());
            let display_name =
                env::var("LOTLINE_USER_NAME").unwrap_or_else(|_| "Smoke User".to_owned());
            Arc::new(InMemorySession::signed_in(SessionUser { id, display_name }, token))
        }
        Err(_) => {
            println!("LOTLINE_TOKEN not set; running signed out, API calls will fail fast.");
            Arc::new(InMemorySession::new())
        }
    };

    let handle = spawn_runtime(
        ChatRuntimeConfig::new(rest_base_url, gateway_url),
        session,
    );
    let mut events = handle.subscribe();

    let _ = handle.send(ChatCommand::Open).await;
    let _ = handle.send(ChatCommand::ListConversations).await;
    if let Ok(conversation_id) = env::var("LOTLINE_CONVERSATION") {
        let _ = handle
            .send(ChatCommand::JoinConversation { conversation_id })
            .await;
    }

    println!("Watching chat events for 30 seconds; Ctrl-C quits earlier.");
    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                match event {
                    Ok(ChatEvent::ConnectionChanged { state }) => {
                        println!("connection: {state:?}");
                    }
                    Ok(event) => println!("event: {event:?}"),
                    Err(err) => {
                        eprintln!("event stream ended: {err}");
                        break;
                    }
                }
            }
        }
    }

    let _ = handle.send(ChatCommand::Close).await;
}
