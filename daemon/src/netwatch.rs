//! Default-route watching over rtnetlink.
//!
//! Dumps links and IPv4 routes at startup, then stays subscribed to route
//! and link changes. The engine only cares about one distilled fact: is
//! there a default route on a real underlying device (not our own tun),
//! and which device is it.

use netlink_packet_route::NetlinkPayload::InnerMessage;
use netlink_packet_route::RtnlMessage::*;
use netlink_packet_route::{
    constants::*, LinkMessage, NetlinkHeader, NetlinkMessage, NetlinkPayload, RouteMessage,
    RtnlMessage,
};
use netlink_sys::TokioSocket as Socket;
use netlink_sys::{protocols, SocketAddr};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// The last underlying default route went away.
    Lost,
    /// An underlying default route exists (again).
    Available { device: Option<String> },
}

/// Start the watcher. Resolves once the initial dump is complete, with the
/// current underlying device and the change stream.
pub async fn start(
    exclude_device: &str,
) -> std::io::Result<(Option<String>, mpsc::Receiver<NetEvent>)> {
    let (events_tx, events_rx) = mpsc::channel(16);
    let (init_tx, init_rx) = oneshot::channel();
    let exclude = exclude_device.to_string();
    tokio::spawn(async move {
        if let Err(e) = run(exclude, events_tx, init_tx).await {
            tracing::warn!(error = %e, "network watcher stopped");
        }
    });
    let initial = init_rx
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "netlink dump failed"))?;
    Ok((initial, events_rx))
}

struct WatchState {
    exclude: String,
    links: HashMap<u32, String>,
    /// Egress interface indexes of current default routes, tun excluded.
    defaults: HashSet<u32>,
}

impl WatchState {
    fn device(&self) -> Option<String> {
        self.defaults
            .iter()
            .next()
            .and_then(|idx| self.links.get(idx).cloned())
    }

    fn is_excluded(&self, ifidx: u32) -> bool {
        self.links.get(&ifidx).is_some_and(|name| *name == self.exclude)
    }

    fn process_newlink(&mut self, link: &LinkMessage) {
        use netlink_packet_route::link::nlas::Nla::*;
        for nla in &link.nlas {
            if let IfName(name) = nla {
                self.links.insert(link.header.index, name.clone());
            }
        }
    }

    fn process_dellink(&mut self, link: &LinkMessage) {
        self.links.remove(&link.header.index);
        self.defaults.remove(&link.header.index);
    }

    fn process_route(&mut self, route: &RouteMessage, added: bool) {
        let Some(oifidx) = decode_default_route(route) else {
            return;
        };
        if self.is_excluded(oifidx) {
            return;
        }
        if added {
            self.defaults.insert(oifidx);
        } else {
            self.defaults.remove(&oifidx);
        }
    }
}

/// The egress ifindex of an IPv4 default route in the main table, or None
/// for any other route message.
fn decode_default_route(route: &RouteMessage) -> Option<u32> {
    use netlink_packet_route::rtnl::nlas::route::Nla::*;
    if route.header.address_family as u16 != AF_INET {
        return None;
    }
    if route.header.destination_prefix_length != 0 {
        return None;
    }
    let mut oifidx = None;
    for nla in &route.nlas {
        match nla {
            Oif(oif) => oifidx = Some(*oif),
            Table(254) => (),
            // Routes outside the main table don't count.
            Table(_) => return None,
            _ => (),
        }
    }
    oifidx
}

async fn send_dump(
    socket: &mut Socket,
    seq: &mut u32,
    payload: RtnlMessage,
) -> std::io::Result<()> {
    let mut packet = NetlinkMessage {
        header: NetlinkHeader {
            flags: NLM_F_REQUEST | NLM_F_DUMP,
            sequence_number: *seq,
            ..Default::default()
        },
        payload: NetlinkPayload::from(payload),
    };
    *seq += 1;
    packet.finalize();

    let mut buf = vec![0; packet.header.length as usize];
    // The serialize buffer must match the finalized length exactly.
    assert!(buf.len() == packet.buffer_len());
    packet.serialize(&mut buf[..]);
    socket.send(&buf[..]).await?;
    Ok(())
}

async fn run(
    exclude: String,
    events: mpsc::Sender<NetEvent>,
    init: oneshot::Sender<Option<String>>,
) -> std::io::Result<()> {
    let mut socket = Socket::new(protocols::NETLINK_ROUTE)?;
    socket.bind_auto()?;
    socket.connect(&SocketAddr::new(0, 0))?;
    socket.add_membership(RTNLGRP_LINK)?;
    socket.add_membership(RTNLGRP_IPV4_ROUTE)?;

    let mut state = WatchState {
        exclude,
        links: HashMap::new(),
        defaults: HashSet::new(),
    };

    enum Phase {
        ReadingLinks,
        ReadingRoutes,
        Streaming,
    }

    let mut seq = 1;
    send_dump(&mut socket, &mut seq, GetLink(LinkMessage::default())).await?;
    let mut phase = Phase::ReadingLinks;
    let mut init = Some(init);

    let mut receive_buffer = vec![0; 8192];
    let mut had_default = false;

    while let Ok(size) = socket.recv(&mut receive_buffer[..]).await {
        let mut offset = 0;
        // A dump reply is a multipart message; walk every packet in the
        // datagram.
        loop {
            let bytes = &receive_buffer[offset..];
            let rx_packet = match <NetlinkMessage<RtnlMessage>>::deserialize(bytes) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable netlink message");
                    break;
                }
            };

            let done = match &rx_packet.payload {
                InnerMessage(NewLink(link)) => {
                    state.process_newlink(link);
                    false
                }
                InnerMessage(DelLink(link)) => {
                    state.process_dellink(link);
                    false
                }
                InnerMessage(NewRoute(route)) => {
                    state.process_route(route, true);
                    false
                }
                InnerMessage(DelRoute(route)) => {
                    state.process_route(route, false);
                    false
                }
                NetlinkPayload::Done => true,
                other => {
                    tracing::trace!(?other, "ignored netlink message");
                    false
                }
            };

            if done {
                match phase {
                    Phase::ReadingLinks => {
                        use netlink_packet_route::RouteHeader;
                        send_dump(
                            &mut socket,
                            &mut seq,
                            GetRoute(RouteMessage {
                                header: RouteHeader {
                                    address_family: AF_INET as u8,
                                    ..Default::default()
                                },
                                ..Default::default()
                            }),
                        )
                        .await?;
                        phase = Phase::ReadingRoutes;
                    }
                    Phase::ReadingRoutes => {
                        had_default = !state.defaults.is_empty();
                        if let Some(init) = init.take() {
                            let _ = init.send(state.device());
                        }
                        phase = Phase::Streaming;
                    }
                    Phase::Streaming => {}
                }
            }

            if matches!(phase, Phase::Streaming) {
                let has_default = !state.defaults.is_empty();
                if has_default != had_default {
                    had_default = has_default;
                    let event = if has_default {
                        NetEvent::Available {
                            device: state.device(),
                        }
                    } else {
                        NetEvent::Lost
                    };
                    tracing::info!(?event, "default route changed");
                    if events.try_send(event).is_err() {
                        tracing::warn!("network event dropped, consumer lagging");
                    }
                }
            }

            offset += rx_packet.header.length as usize;
            if offset >= size || rx_packet.header.length == 0 {
                break;
            }
        }
    }
    Ok(())
}
