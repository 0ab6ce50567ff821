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

use crate::destinations::{Destination, Destinations, ForwardError, ForwardResult};
use crate::events::Envelope;

use std::sync::Arc;
use std::time::Instant;
use tokio;
use tokio::task::JoinHandle;
use log;

/// Hands an event over to every destination, each in its own task
///
/// Nothing waits on the returned handles in production: the inbound request
/// is answered right away and destinations finish in the background.
pub fn dispatch(destinations: &Destinations, envelope: Envelope) -> Vec<JoinHandle<ForwardResult>> {
    let envelope = Arc::new(envelope);
    destinations.iter()
        .map(|destination| {
            let destination = destination.clone();
            let envelope = envelope.clone();
            tokio::task::spawn(async move {
                let started = Instant::now();
                let result = destination.forward(&envelope).await;
                report(destination.as_ref(), &envelope, &result, started);
                result
            })
        })
        .collect()
}

/// Logs the outcome of a single forward
fn report(destination: &dyn Destination, envelope: &Envelope, result: &ForwardResult, started: Instant) {
    let rid = envelope.rid();
    let elapsed = started.elapsed().as_millis();
    match result {
        Ok(()) => log::info!(rid = rid; "forwarded to {} in {}ms", destination, elapsed),
        Err(e @ ForwardError::ConfigMissing(_)) => log::debug!(rid = rid; "skipping {}: {}", destination, e),
        Err(e @ ForwardError::ValidationFailed(_)) => log::warn!(rid = rid; "{} rejected the event: {}", destination, e),
        Err(e @ ForwardError::Timeout(_)) => log::warn!(rid = rid; "{} did not answer in time: {}", destination, e),
        Err(e) if e.is_transport() => log::error!(rid = rid; "failed to forward to {} after {}ms: {}", destination, elapsed, e),
        Err(e) => log::error!(rid = rid; "failed to forward to {}: {}", destination, e),
    }
}
