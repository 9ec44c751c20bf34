use std::sync::Arc;
use std::time::Duration;

use pingora::services::{background::background_service, listening::Service};
use pingora_core::server::{configuration::Opt, Server};
use sentry::IntoDsn;

use purge_proxy::{
    config::{Config, Discovery},
    discovery::{CachedInventory, EtcdInventory, Inventory, StaticInventory},
    logging::FileLogger,
    service::{purge::PurgeHttpApp, status, status::StatusHttpApp},
};

fn main() {
    // Load configuration and command-line arguments
    let cli_options = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    let logger = if let Some(log_cfg) = &config.log {
        let logger = FileLogger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger)
    } else {
        env_logger::init();
        None
    };

    let mut inventory = build_inventory(&config.discovery);
    let refresh = match config.discovery.refresh_interval {
        Some(secs) => {
            let cache = CachedInventory::new(
                inventory.clone(),
                config.tags.clone(),
                Duration::from_secs(secs),
            );
            let service = background_service("inventory refresh", cache);
            inventory = service.task();
            Some(service)
        }
        None => None,
    };

    log::info!(
        "Purging hosts tagged {} via {} inventory",
        config.tags.join(","),
        inventory.name()
    );
    let purge_service = PurgeHttpApp::purge_http_service(&config, inventory);

    let status_service = config.status.as_ref().map(StatusHttpApp::status_http_service);
    let prometheus_service = config.prometheus.as_ref().map(|prometheus_cfg| {
        let mut service = Service::prometheus_http_service();
        service.add_tcp(&prometheus_cfg.address.to_string());
        service
    });
    let sentry = config.sentry.as_ref().and_then(|sentry_cfg| {
        match sentry_cfg.dsn.clone().into_dsn() {
            Ok(Some(dsn)) => Some(sentry::ClientOptions {
                dsn: Some(dsn),
                ..Default::default()
            }),
            Ok(None) => {
                log::warn!("Sentry DSN is empty, Sentry disabled.");
                None
            }
            Err(e) => {
                log::error!("Error parsing Sentry DSN: {e}");
                None
            }
        }
    });

    // Create server instance
    let mut server = Server::new_with_opt_and_conf(Some(cli_options), config.pingora);
    server.sentry = sentry;

    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        server.add_service(log_service);
    }
    if let Some(refresh_service) = refresh {
        log::info!("Adding inventory refresh service...");
        server.add_service(refresh_service);
    }
    if let Some(status_service) = status_service {
        log::info!("Adding Status HTTP...");
        server.add_service(status_service);
    }
    if let Some(prometheus_service) = prometheus_service {
        log::info!("Adding Prometheus HTTP...");
        server.add_service(prometheus_service);
    }

    log::info!("Bootstrapping...");
    server.bootstrap();
    log::info!("Bootstrapped. Adding Services...");
    server.add_service(purge_service);
    status::mark_ready();

    log::info!("Starting Server...");
    server.run_forever();
}

fn build_inventory(discovery: &Discovery) -> Arc<dyn Inventory> {
    match &discovery.etcd {
        Some(etcd_cfg) => {
            log::info!("Using etcd inventory under {}", etcd_cfg.prefix);
            Arc::new(EtcdInventory::new(etcd_cfg.clone()))
        }
        None => {
            log::info!("Using static inventory of {} hosts", discovery.hosts.len());
            Arc::new(StaticInventory::new(discovery.hosts.clone()))
        }
    }
}
