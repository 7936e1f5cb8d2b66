//! Thin CLI binary (spec §11.1/§2 item 13). Exit code 0 on success, 1
//! on argument or user-existence failure, per spec §6.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use meshpost::config::{Command, Config};
use meshpost::identity::{FsIdentityStore, IdentityStore};
use meshpost::{challenge, discovery, maintenance, messaging, pubkey, surface};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let config = Config::parse();

    let username = match config.resolve_username() {
        Ok(username) => username,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config, username).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, username: String) -> Result<(), String> {
    if let Command::Init = config.command {
        FsIdentityStore::init(&config.home, &username)
            .await
            .map_err(|e| e.to_string())?;
        println!("created identity for {username} under {}", config.home.display());
        return Ok(());
    }

    let store: Arc<dyn IdentityStore> = Arc::new(
        FsIdentityStore::open(&config.home, &username)
            .await
            .map_err(|e| e.to_string())?,
    );

    match config.command {
        Command::Init => unreachable!("handled above"),

        Command::Surface { host, port } => {
            let node = Arc::new(meshpost::transport::Node::new(store));
            let surfacing_node = Arc::clone(&node);
            let maintenance_handle = tokio::spawn(maintenance::run(surfacing_node));
            let result = surface::run(node.store.clone(), &host, port, 64).await;
            maintenance_handle.abort();
            result.map_err(|e| e.to_string())
        }

        Command::Seek { target } => {
            let node = meshpost::transport::Node::new(store);
            let response = discovery::seek_user(&node, &target).await.map_err(|e| e.to_string())?;
            println!("{}", response.field_str("message").unwrap_or(""));
            Ok(())
        }

        Command::Ping { target } => {
            let node = meshpost::transport::Node::new(store);
            let frame = meshpost::frame::Frame::new(meshpost::frame::Action::Ping, serde_json::json!({}))
                .map_err(|e| e.to_string())?;
            let response = meshpost::transport::send_frame_to_user(node.store.as_ref(), &target, &frame)
                .await
                .map_err(|e| e.to_string())?;
            println!("success={}", response.success);
            Ok(())
        }

        Command::SendMessage { target, path, mime_type } => {
            let node = meshpost::transport::Node::new(store);
            let content = tokio::fs::read(&path).await.map_err(|e| e.to_string())?;
            let filename = path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("message")
                .to_string();
            let response = messaging::send_message(&node, &target, &filename, &mime_type, &content)
                .await
                .map_err(|e| e.to_string())?;
            println!("success={}", response.success);
            Ok(())
        }

        Command::ChallengePk { target } => {
            let node = meshpost::transport::Node::new(store);
            let result = challenge::challenge_user_pk(&node, &target).await.map_err(|e| e.to_string())?;
            println!("challenge_user_pk({target}) = {result}");
            Ok(())
        }

        Command::ChallengeHasPk { target } => {
            let node = meshpost::transport::Node::new(store);
            let result = challenge::challenge_user_has_pk(&node, &target)
                .await
                .map_err(|e| e.to_string())?;
            println!("challenge_user_has_pk({target}) = {result}");
            Ok(())
        }

        Command::RequestPublicKey { target } => {
            let node = meshpost::transport::Node::new(store);
            let response = pubkey::request_public_key(&node, &target).await.map_err(|e| e.to_string())?;
            println!("success={}", response.success);
            Ok(())
        }

        Command::ProcessPkRequests => {
            let node = meshpost::transport::Node::new(store);
            let answered = pubkey::process_public_key_requests(&node).await.map_err(|e| e.to_string())?;
            println!("answered {} request(s): {:?}", answered.len(), answered);
            Ok(())
        }

        Command::ProcessPkResponses => {
            let node = meshpost::transport::Node::new(store);
            let committed = pubkey::process_public_key_responses(&node).await.map_err(|e| e.to_string())?;
            if !committed.is_empty() {
                println!(
                    "committed {} key(s): {:?} - run challenge-pk to verify them",
                    committed.len(),
                    committed
                );
            } else {
                println!("no pending responses");
            }
            Ok(())
        }

        Command::AddIpcache { username, ip, port } => {
            store.set_contact(&username, &ip, port).await.map_err(|e| e.to_string())?;
            println!("recorded {username} at {ip}:{port}");
            Ok(())
        }

        Command::RemoveIpcache { username } => {
            store.remove_contact(&username).await.map_err(|e| e.to_string())?;
            println!("removed {username} from ipcache");
            Ok(())
        }

        Command::Ipcache => {
            let contacts = store.list_contacts().await.map_err(|e| e.to_string())?;
            for (username, entry) in contacts {
                println!("{username}\t{}:{}\tlast_seen={}", entry.ip, entry.port, entry.last_seen);
            }
            Ok(())
        }

        Command::PublicKeys => {
            let keys = store.list_public_keys().await.map_err(|e| e.to_string())?;
            for (username, record) in keys {
                println!("{username}\tmodified_at={}", record.modified_at);
            }
            Ok(())
        }

        Command::Messages => {
            let ids = store.list_message_ids().await.map_err(|e| e.to_string())?;
            for id in ids {
                println!("{id}");
            }
            Ok(())
        }

        Command::Pulse => {
            let node = meshpost::transport::Node::new(store);
            let response = discovery::pulse_network(&node).await.map_err(|e| e.to_string())?;
            println!("{}", response.field_str("message").unwrap_or(""));
            Ok(())
        }

        Command::CheckNetTopo => {
            let node = meshpost::transport::Node::new(store);
            let response = discovery::check_net_topo(&node).await.map_err(|e| e.to_string())?;
            println!("{}", response.field_str("message").unwrap_or(""));
            Ok(())
        }
    }
}
