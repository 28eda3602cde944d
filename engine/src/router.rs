//! Fan-out of the global peer queue into endpoint inbound queues.
//!
//! Addressing violations are logged and dropped, never fatal: one peer's bad
//! envelope must not disturb the others. FIFO per (source, destination)
//! follows from the global queue and the inbound queues both being FIFO.

use std::collections::HashMap;

use protocol::{Packet, PacketRegistry, PeerId, Recipients};

use crate::endpoint::Endpoint;

pub(crate) fn route_packet(
    registry: &PacketRegistry,
    endpoints: &HashMap<PeerId, Endpoint>,
    packet: Packet,
) {
    let kind = registry.name(packet.kind());

    let destinations: &[PeerId] = match &packet.to_pid {
        Recipients::Local => {
            log::error!(
                "'{kind}' packet from {} dropped: local destination in the peer queue; \
                 use the client queue instead",
                packet.from_pid
            );
            return;
        }
        Recipients::One(pid) => std::slice::from_ref(pid),
        Recipients::Many(pids) => {
            if pids.is_empty() {
                log::error!(
                    "'{kind}' packet from {} dropped: empty recipient list",
                    packet.from_pid
                );
                return;
            }
            pids
        }
    };

    for &to_pid in destinations {
        if to_pid == packet.from_pid {
            log::error!(
                "'{kind}' packet dropped: direction to {to_pid} is ambiguous in the peer queue"
            );
            continue;
        }
        if packet.from_pid.is_broadcast() {
            log::error!("'{kind}' packet dropped: source pid must be specific");
            continue;
        }
        if packet.exclude_sender && !to_pid.is_broadcast() {
            log::error!(
                "'{kind}' packet from {} dropped: exclude_sender requires a broadcast destination",
                packet.from_pid
            );
            continue;
        }

        if to_pid.is_broadcast() {
            for (pid, endpoint) in endpoints {
                if packet.exclude_sender && *pid == packet.from_pid {
                    continue;
                }
                endpoint.push_inbound(packet.clone());
            }
        } else if let Some(endpoint) = endpoints.get(&to_pid) {
            endpoint.push_inbound(packet.clone());
        } else {
            log::error!(
                "'{kind}' packet from {} dropped: {to_pid} is not connected",
                packet.from_pid
            );
        }
    }
}
