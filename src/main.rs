use std::{process, sync::Arc};

use tokio::sync::Mutex;
use tracing::{error, info};

mod api;
mod config;
mod error;
mod hostnet;
mod leases;
mod library;
mod manager;
mod overlay;
mod qemu;
mod supervisor;
mod tuntap;

use config::LabConfig;
use manager::LabManager;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = match LabConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid LABVISOR_CONFIG: {}", e);
            process::exit(1);
        }
    };

    if !config.library_dir.is_dir() {
        error!(
            "firmware library {} does not exist",
            config.library_dir.display()
        );
        process::exit(1);
    }

    let manager = match LabManager::new(config.clone()) {
        Ok(manager) => manager,
        Err(e) => {
            error!("failed to initialize lab manager: {}", e);
            process::exit(1);
        }
    };

    info!(
        "firmware library: {}  external bridge: {}",
        config.library_dir.display(),
        config.external_bridge
    );

    if let Err(e) = api::serve(Arc::new(Mutex::new(manager)), config.listen_addr).await {
        error!("server error: {}", e);
        process::exit(1);
    }
}
