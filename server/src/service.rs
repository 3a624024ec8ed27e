//! Per-connection service routine
//!
//! Each accepted connection gets one task running [`client_service`]: a
//! loop that polls for a pending laser hit, waits on the next inbound
//! frame, and dispatches it. The wait races three events: the framed read
//! (cancellation safe, so a lost race never loses bytes), the bound
//! player's hit notification, and the registry's shutdown request.

use std::future;
use std::sync::Arc;

use log::{debug, warn};
use tokio::net::TcpStream;

use shared::{send_packet, FrameReader, Packet, PacketHeader, PacketType};

use crate::player::{ClientWriter, Player};
use crate::server::ServerContext;

/// Services one client connection until it disconnects, errors, or is told
/// to shut down; then logs out any bound player and unregisters.
pub async fn client_service(ctx: Arc<ServerContext>, stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    let Some(handle) = ctx.registry.register() else {
        warn!("refusing connection from {:?}: server full", peer);
        return;
    };
    debug!("client {}: connected from {:?}", handle.id, peer);

    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let writer: ClientWriter = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut player: Option<Arc<Player>> = None;

    loop {
        // Process a hit flagged before we went back to reading.
        if let Some(p) = &player {
            p.check_for_hit(&ctx.players, &ctx.maze).await;
        }

        let packet = tokio::select! {
            res = reader.read_packet() => match res {
                Ok(packet) => packet,
                Err(err) => {
                    debug!("client {}: receive ended: {}", handle.id, err);
                    break;
                }
            },
            // A laser hit landed while we were blocked; go process it.
            _ = hit_pending(&player) => continue,
            _ = handle.shutdown_requested() => {
                debug!("client {}: shutdown requested", handle.id);
                break;
            }
        };

        // A hit may also have landed during the read itself.
        if let Some(p) = &player {
            p.check_for_hit(&ctx.players, &ctx.maze).await;
        }

        dispatch(&ctx, &writer, &mut player, packet).await;
    }

    if let Some(player) = player.take() {
        ctx.players.logout(&ctx.maze, &player).await;
    }
    ctx.registry.unregister(handle.id);
    debug!("client {}: disconnected", handle.id);
}

/// Resolves when the bound player is tagged by a laser; never resolves
/// before login.
async fn hit_pending(player: &Option<Arc<Player>>) {
    match player {
        Some(p) => p.hit_notified().await,
        None => future::pending().await,
    }
}

async fn dispatch(
    ctx: &ServerContext,
    writer: &ClientWriter,
    player: &mut Option<Arc<Player>>,
    packet: Packet,
) {
    let header = packet.header;
    match PacketType::from_byte(header.ty) {
        Some(PacketType::Login) => {
            if player.is_some() {
                debug!("ignoring duplicate LOGIN");
                return;
            }
            let name = String::from_utf8_lossy(packet.payload_bytes());
            let name = name.trim_end_matches('\0');

            match ctx
                .players
                .login(&ctx.maze, Arc::clone(writer), header.param1, name)
            {
                Ok(p) => {
                    reply(writer, PacketType::Ready).await;
                    p.reset(&ctx.players, &ctx.maze).await;
                    debug!("maze after login:\n{}", ctx.maze);
                    *player = Some(p);
                }
                Err(err) => {
                    debug!("login refused: {}", err);
                    reply(writer, PacketType::InUse).await;
                }
            }
        }
        Some(PacketType::Move) => {
            if let Some(p) = player {
                p.move_player(&ctx.players, &ctx.maze, header.param1 as i8)
                    .await;
            }
        }
        Some(PacketType::Turn) => {
            if let Some(p) = player {
                p.rotate(&ctx.maze, header.param1 as i8).await;
            }
        }
        Some(PacketType::Fire) => {
            if let Some(p) = player {
                p.fire_laser(&ctx.players, &ctx.maze).await;
            }
        }
        Some(PacketType::Refresh) => {
            if let Some(p) = player {
                p.invalidate_view().await;
                p.update_view(&ctx.maze).await;
            }
        }
        Some(PacketType::Send) => {
            if let (Some(p), Some(payload)) = (player.as_ref(), packet.payload.as_deref()) {
                p.send_chat(&ctx.players, payload).await;
            }
        }
        other => {
            // Unknown or out-of-place frame; ignore it.
            debug!("ignoring frame type {:?} (byte {})", other, header.ty);
        }
    }
}

/// Sends a bare reply frame on a connection that may not have a player yet.
async fn reply(writer: &ClientWriter, ty: PacketType) {
    let mut header = PacketHeader::new(ty);
    let mut writer = writer.lock().await;
    if let Err(err) = send_packet(&mut *writer, &mut header, None).await {
        debug!("failed to send {:?} reply: {}", ty, err);
    }
}
