//! Players: records, the avatar-indexed table, and every game operation
//!
//! A [`Player`] is shared between its own service task (which drives its
//! commands) and every other task that needs to reach it (laser fire,
//! broadcasts), so records live behind `Arc` and each internal concern has
//! its own guard:
//!
//! - positional state (row, col, gaze, score) behind a plain mutex, never
//!   held across an await;
//! - the connection's write half behind an async mutex, so frames to one
//!   client never interleave;
//! - the view cache behind an async mutex held across emission, so two view
//!   updates for the same player cannot interleave their SHOW runs;
//! - the laser-hit flag as an atomic plus a [`Notify`], the only player
//!   state a shooter ever touches.
//!
//! Lock order: a player's positional lock may be held while taking the maze
//! lock (never the other way around), and at most one player's locks are
//! held at a time. Broadcasts snapshot the table under the table lock, then
//! release it before touching any player.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info};
use thiserror::Error;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration};

use shared::{PacketHeader, PacketType};

use crate::maze::{self, Direction, Maze, View, VIEW_DEPTH, VIEW_WIDTH};

/// Size of the avatar-indexed player table (the full byte space).
pub const MAX_PLAYERS: usize = 256;

/// How long a player stays out of the maze after being hit.
const PURGATORY: Duration = Duration::from_secs(3);

/// Upper bound on a formatted chat line.
const CHAT_LINE_MAX: usize = 1024;

/// Scoreboard wire value that removes an entry.
const SCORE_REMOVE: i8 = -1;

/// The write half of a client connection, shared between the service task
/// (pre-login replies) and the player record.
pub type ClientWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Why a login attempt was refused.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("avatar {0:?} is already in use")]
    AvatarInUse(char),
    #[error("avatar byte {0:#04x} is not an uppercase letter")]
    BadAvatar(u8),
    #[error("no empty maze cell could be found")]
    MazeFull,
}

struct Position {
    row: usize,
    col: usize,
    dir: Direction,
    score: i32,
}

struct ViewCache {
    last: View,
    /// Steps of `last` that were actually sent; -1 means no valid view.
    valid_depth: i32,
}

/// Server-side state for one logged-in player.
pub struct Player {
    avatar: u8,
    name: String,
    writer: ClientWriter,
    state: Mutex<Position>,
    view: tokio::sync::Mutex<ViewCache>,
    laser_hit: AtomicBool,
    hit_notify: Notify,
}

impl Player {
    pub fn avatar(&self) -> u8 {
        self.avatar
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the player's coordinates and gaze.
    pub fn location(&self) -> (usize, usize, Direction) {
        let pos = self.state.lock().unwrap();
        (pos.row, pos.col, pos.dir)
    }

    pub fn score(&self) -> i32 {
        self.state.lock().unwrap().score
    }

    /// Sends one frame to this player's client. The write half's lock
    /// keeps frames to one client from interleaving.
    pub async fn send_packet(
        &self,
        mut header: PacketHeader,
        payload: Option<&[u8]>,
    ) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        shared::send_packet(&mut *writer, &mut header, payload).await
    }

    /// Resolves once this player has been tagged by a laser. A tag applied
    /// while nobody is waiting is not lost.
    pub async fn hit_notified(&self) {
        self.hit_notify.notified().await;
    }

    /// Steps the avatar forward (`sign` >= 0) or backward (`sign` == -1).
    /// A blocked move changes nothing and sends no notification. Every
    /// live player's view is refreshed afterwards.
    pub async fn move_player(&self, table: &PlayerTable, maze: &Maze, sign: i8) {
        {
            let mut pos = self.state.lock().unwrap();
            let move_dir = if sign == -1 { pos.dir.reverse() } else { pos.dir };
            if maze.try_move(pos.row, pos.col, move_dir) {
                let (dr, dc) = move_dir.offset();
                pos.row = (pos.row as i64 + dr) as usize;
                pos.col = (pos.col as i64 + dc) as usize;
                debug!(
                    "move: {}[{}] now at [{}, {}]",
                    self.name, self.avatar as char, pos.row, pos.col
                );
            }
        }
        table.update_all_views(maze).await;
    }

    /// Rotates the gaze one quarter turn: `sign` == 1 counterclockwise,
    /// anything else clockwise. The view cache is invalidated so the client
    /// gets a full redraw.
    pub async fn rotate(&self, maze: &Maze, sign: i8) {
        {
            let mut pos = self.state.lock().unwrap();
            pos.dir = if sign == 1 {
                pos.dir.turn_left()
            } else {
                pos.dir.turn_right()
            };
        }
        self.invalidate_view().await;
        self.update_view(maze).await;
    }

    /// Marks the cached view stale; the next update sends CLEAR plus the
    /// full grid.
    pub async fn invalidate_view(&self) {
        self.view.lock().await.valid_depth = -1;
    }

    /// Recomputes this player's view and sends whatever the client is
    /// missing: a CLEAR and every cell when the cache is invalid, otherwise
    /// one SHOW per changed cell (no batching; empty cells included on a
    /// full redraw, for client compatibility).
    pub async fn update_view(&self, maze: &Maze) {
        let mut cache = self.view.lock().await;

        let (row, col, dir) = self.location();
        let mut fresh = [[maze::EMPTY; VIEW_WIDTH]; VIEW_DEPTH];
        let depth = maze.get_view(&mut fresh, row, col, dir, VIEW_DEPTH);

        let updates = view_updates(&cache, &fresh, depth);
        cache.last = fresh;
        cache.valid_depth = depth as i32;

        for header in updates {
            if self.send_packet(header, None).await.is_err() {
                // Dead connection; its service loop will notice shortly.
                break;
            }
        }
    }

    /// Fires a laser along the gaze. If the beam reaches another avatar
    /// before any wall, that player is tagged (flag plus wakeup; nothing
    /// else of the victim's is touched from here), the shooter's score is
    /// incremented, and the new score is broadcast.
    pub async fn fire_laser(&self, table: &PlayerTable, maze: &Maze) {
        let (row, col, dir) = self.location();
        let target = maze.find_target(row, col, dir);
        if !maze::is_avatar(target) {
            debug!("fire: {}[{}] hit nothing", self.name, self.avatar as char);
            return;
        }

        let Some(victim) = table.get(target) else {
            debug!("fire: target {} not in player table", target as char);
            return;
        };
        victim.laser_hit.store(true, Ordering::SeqCst);
        victim.hit_notify.notify_one();

        let score = {
            let mut pos = self.state.lock().unwrap();
            pos.score += 1;
            pos.score
        };
        info!(
            "fire: {}[{}] hit {} (score {})",
            self.name, self.avatar as char, target as char, score
        );

        let update = PacketHeader {
            param1: self.avatar,
            param2: score as u8,
            ..PacketHeader::new(PacketType::Score)
        };
        table.broadcast(update, None).await;
    }

    /// Processes a pending laser hit, if any: clears the flag, removes the
    /// avatar from the maze, refreshes everyone's view, ALERTs the victim,
    /// holds them in purgatory, then respawns them via [`reset`](Self::reset).
    ///
    /// The service loop calls this before and after each receive.
    pub async fn check_for_hit(&self, table: &PlayerTable, maze: &Maze) {
        if !self.laser_hit.swap(false, Ordering::SeqCst) {
            return;
        }

        let (row, col, _) = self.location();
        maze.remove(self.avatar, row, col);
        debug!(
            "hit: removed {}[{}] from [{}, {}]",
            self.name, self.avatar as char, row, col
        );
        table.update_all_views(maze).await;

        let _ = self.send_packet(PacketHeader::new(PacketType::Alert), None).await;

        sleep(PURGATORY).await;
        self.reset(table, maze).await;
    }

    /// Respawns the player: removes them from their current cell, zeroes
    /// the score, and places them at a random empty cell. On success the
    /// player receives every other score, their own reset is broadcast, and
    /// all views are refreshed.
    ///
    /// If no empty cell can be found the player is left in limbo: logged
    /// in, absent from the grid, coordinates stale. Logged at error level.
    pub async fn reset(&self, table: &PlayerTable, maze: &Maze) {
        let placed = {
            let mut pos = self.state.lock().unwrap();
            maze.remove(self.avatar, pos.row, pos.col);
            pos.score = 0;
            match maze.set_player_random(self.avatar) {
                Some((row, col)) => {
                    pos.row = row;
                    pos.col = col;
                    true
                }
                None => false,
            }
        };
        if !placed {
            error!(
                "reset: no empty cell for {}[{}]; player left in limbo",
                self.name, self.avatar as char
            );
            return;
        }

        // Catch this player up on everyone else's score.
        for other in table.live_players() {
            if other.avatar == self.avatar {
                continue;
            }
            let entry = PacketHeader {
                param1: other.avatar,
                param2: other.score() as u8,
                ..PacketHeader::new(PacketType::Score)
            };
            let _ = self.send_packet(entry, None).await;
        }

        let zeroed = PacketHeader {
            param1: self.avatar,
            param2: 0,
            ..PacketHeader::new(PacketType::Score)
        };
        table.broadcast(zeroed, None).await;
        table.update_all_views(maze).await;
    }

    /// Broadcasts a chat line as `"<name>[<avatar>] <msg>"`, truncated to
    /// 1024 bytes. The payload is exactly `size` bytes; no NUL terminator.
    pub async fn send_chat(&self, table: &PlayerTable, msg: &[u8]) {
        let text = String::from_utf8_lossy(msg);
        let mut line = format!("{}[{}] {}", self.name, self.avatar as char, text).into_bytes();
        line.truncate(CHAT_LINE_MAX);

        let header = PacketHeader {
            size: line.len() as u16,
            ..PacketHeader::new(PacketType::Chat)
        };
        table.broadcast(header, Some(&line)).await;
        debug!("chat: {}[{}] broadcast {} bytes", self.name, self.avatar as char, line.len());
    }
}

/// Computes the frames a client needs to catch its view up to `fresh`.
///
/// With no valid cached view: CLEAR, then a SHOW for every cell in
/// (depth, x) order. Otherwise: a SHOW for each cell that differs from the
/// cache, compared over the fresh depth only; rows beyond it are left to
/// the client, as existing clients expect.
fn view_updates(cache: &ViewCache, fresh: &View, depth: usize) -> Vec<PacketHeader> {
    let mut updates = Vec::new();
    let full = cache.valid_depth < 0;
    if full {
        updates.push(PacketHeader::new(PacketType::Clear));
    }
    for (d, row) in fresh.iter().enumerate().take(depth) {
        for (x, &cell) in row.iter().enumerate() {
            if full || cell != cache.last[d][x] {
                updates.push(PacketHeader {
                    param1: cell,
                    param2: x as u8,
                    param3: d as u8,
                    ..PacketHeader::new(PacketType::Show)
                });
            }
        }
    }
    updates
}

struct Slots {
    players: [Option<Arc<Player>>; MAX_PLAYERS],
}

/// The avatar-indexed table of logged-in players.
///
/// `slots[a]` holding a player implies that player's avatar is `a` and that
/// the table owns one strong reference to it; transient users clone the
/// `Arc` and the record is freed when the last clone drops.
pub struct PlayerTable {
    slots: Mutex<Slots>,
}

impl PlayerTable {
    pub fn new() -> Self {
        PlayerTable {
            slots: Mutex::new(Slots {
                players: std::array::from_fn(|_| None),
            }),
        }
    }

    /// Logs a player in: claims the avatar slot, places them at a random
    /// empty maze cell, and installs the record. The caller still owes the
    /// client a READY and a [`Player::reset`].
    pub fn login(
        &self,
        maze: &Maze,
        writer: ClientWriter,
        avatar: u8,
        name: &str,
    ) -> Result<Arc<Player>, LoginError> {
        if !maze::is_avatar(avatar) {
            return Err(LoginError::BadAvatar(avatar));
        }

        let mut slots = self.slots.lock().unwrap();
        if slots.players[avatar as usize].is_some() {
            return Err(LoginError::AvatarInUse(avatar as char));
        }

        let (row, col) = maze
            .set_player_random(avatar)
            .ok_or(LoginError::MazeFull)?;

        let name = if name.is_empty() { "Anonymous" } else { name };
        let player = Arc::new(Player {
            avatar,
            name: name.to_string(),
            writer,
            state: Mutex::new(Position {
                row,
                col,
                dir: Direction::North,
                score: 0,
            }),
            view: tokio::sync::Mutex::new(ViewCache {
                last: [[maze::EMPTY; VIEW_WIDTH]; VIEW_DEPTH],
                valid_depth: -1,
            }),
            laser_hit: AtomicBool::new(false),
            hit_notify: Notify::new(),
        });
        slots.players[avatar as usize] = Some(Arc::clone(&player));
        info!(
            "login: {}[{}] entered the maze at [{}, {}]",
            player.name, avatar as char, row, col
        );
        Ok(player)
    }

    /// Logs a player out: clears their slot (only if it still holds this
    /// record), removes them from the grid, drops their scoreboard entry
    /// everywhere, and refreshes the remaining players' views.
    pub async fn logout(&self, maze: &Maze, player: &Arc<Player>) {
        {
            let mut slots = self.slots.lock().unwrap();
            let slot = &mut slots.players[player.avatar as usize];
            if slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, player)) {
                *slot = None;
            }
        }

        let (row, col, _) = player.location();
        maze.remove(player.avatar, row, col);

        let removal = PacketHeader {
            param1: player.avatar,
            param2: SCORE_REMOVE as u8,
            ..PacketHeader::new(PacketType::Score)
        };
        self.broadcast(removal, None).await;
        self.update_all_views(maze).await;
        info!("logout: {}[{}]", player.name, player.avatar as char);
    }

    /// Looks up a player by avatar, handing out an extra reference.
    pub fn get(&self, avatar: u8) -> Option<Arc<Player>> {
        self.slots.lock().unwrap().players[avatar as usize].clone()
    }

    /// Snapshot of every logged-in player, taken under the table lock.
    pub fn live_players(&self) -> Vec<Arc<Player>> {
        let slots = self.slots.lock().unwrap();
        slots.players.iter().flatten().cloned().collect()
    }

    /// Sends a frame to every live player. A failed send skips that
    /// recipient and continues; its own service loop handles the fallout.
    pub async fn broadcast(&self, header: PacketHeader, payload: Option<&[u8]>) {
        for player in self.live_players() {
            if let Err(err) = player.send_packet(header, payload).await {
                debug!(
                    "broadcast: dropping frame for {}: {}",
                    player.avatar as char, err
                );
            }
        }
    }

    /// Refreshes every live player's view. Called after any maze mutation
    /// so clients never need to poll.
    pub async fn update_all_views(&self, maze: &Maze) {
        for player in self.live_players() {
            player.update_view(maze).await;
        }
    }

    /// Drops every remaining record at server teardown.
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.players.iter_mut() {
            *slot = None;
        }
    }
}

impl Default for PlayerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maze::{CORRIDOR, LEFT_WALL, RIGHT_WALL};

    fn cache(valid_depth: i32, last: View) -> ViewCache {
        ViewCache { last, valid_depth }
    }

    fn blank_view() -> View {
        [[maze::EMPTY; VIEW_WIDTH]; VIEW_DEPTH]
    }

    #[test]
    fn invalid_cache_gets_clear_then_full_grid() {
        let mut fresh = blank_view();
        fresh[0] = [b'*', b'A', b'*'];

        let updates = view_updates(&cache(-1, blank_view()), &fresh, 3);

        // CLEAR plus one SHOW per cell, empty cells included.
        assert_eq!(updates.len(), 1 + 3 * VIEW_WIDTH);
        assert_eq!(updates[0].ty, PacketType::Clear as u8);

        // SHOWs walk the grid in (depth, x) order.
        let first = updates[1];
        assert_eq!(first.ty, PacketType::Show as u8);
        assert_eq!(first.param1, b'*');
        assert_eq!((first.param2, first.param3), (LEFT_WALL as u8, 0));
        let second = updates[2];
        assert_eq!(second.param1, b'A');
        assert_eq!((second.param2, second.param3), (CORRIDOR as u8, 0));
        let last = updates[1 + 3 * VIEW_WIDTH - 1];
        assert_eq!((last.param2, last.param3), (RIGHT_WALL as u8, 2));
    }

    #[test]
    fn valid_cache_gets_only_changed_cells() {
        let mut last = blank_view();
        last[0] = [b'*', b'A', b'*'];
        last[1] = [b'*', b' ', b'*'];

        let mut fresh = blank_view();
        fresh[0] = [b'*', b'A', b'*'];
        fresh[1] = [b'*', b'B', b'*'];

        let updates = view_updates(&cache(2, last), &fresh, 2);

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].ty, PacketType::Show as u8);
        assert_eq!(updates[0].param1, b'B');
        assert_eq!((updates[0].param2, updates[0].param3), (CORRIDOR as u8, 1));
    }

    #[test]
    fn unchanged_view_sends_nothing() {
        let mut view = blank_view();
        view[0] = [b'*', b'A', b'*'];
        let updates = view_updates(&cache(4, view), &view, 4);
        assert!(updates.is_empty());
    }

    #[test]
    fn diff_covers_only_fresh_depth() {
        let mut last = blank_view();
        last[3] = [b'#', b'#', b'#'];
        let fresh = blank_view();

        // Depth shrank from 4 to 2: stale deeper rows are left alone.
        let updates = view_updates(&cache(4, last), &fresh, 2);
        assert!(updates.is_empty());
    }

    #[test]
    fn deeper_fresh_rows_diff_against_stale_cache_bytes() {
        let last = blank_view();
        let mut fresh = blank_view();
        fresh[5] = [b'*', b'*', b'*'];

        // Depth grew: the new rows compare against whatever the cache held.
        let updates = view_updates(&cache(3, last), &fresh, 6);
        assert_eq!(updates.len(), 3);
        assert!(updates.iter().all(|u| u.param3 == 5));
    }
}
