/* distrans - a lightweight relay fanning out conversion events to marketing APIs
 * Copyright (C) 2023 Withings
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>. */

mod config;
mod destinations;
mod events;
mod forwarder;
mod identity;
mod logging;
mod middleware;
mod routes;
#[cfg(test)]
mod testing;


use crate::destinations::init_destinations;
use crate::destinations::http::HttpClient;
use crate::middleware::request_logger;

use clap::Parser;
use tokio;
use log;
use warp;
use warp::Filter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file
    config: Option<PathBuf>,
}

/// distrans' entry point
#[tokio::main]
async fn main() {
    /* Set a panic hook: we want a task panic to crash the whole process */
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    /* Locate and parse the configuration file, see config.rs */
    let args = Args::parse();
    let configuration = match config::get_configuration(args.config.as_ref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to process configuration file: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init_logger(&configuration.logging) {
        eprintln!("failed to initialise logging: {}", e);
        std::process::exit(1);
    }

    /* One HTTP client, shared by all destinations */
    let http = match HttpClient::new(*configuration.forwarder.timeout) {
        Ok(h) => h,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    /* Instantiate all Destination structs as per the configuration */
    let destinations = match init_destinations(&configuration.destinations, &http) {
        Ok(d) => d,
        Err(e) => {
            log::error!("destination error: {}", e);
            std::process::exit(1);
        }
    };
    log::info!(
        "forwarding to {} with a {} timeout",
        destinations.iter().map(|d| d.to_string()).collect::<Vec<String>>().join(", "),
        humantime::format_duration(http.timeout())
    );

    let address = SocketAddr::new(configuration.server.ip, configuration.server.port);
    log::info!("listening on {}", address);

    let api = routes::api(Arc::new(destinations), configuration.server.payload_size_limit)
        .with(warp::log::custom(request_logger));
    warp::serve(api).run(address).await;
}
