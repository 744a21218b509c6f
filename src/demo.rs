//! Headless bouncing-balls scene.
//!
//! A small but complete user of the bus, run by the binary and by the
//! integration tests:
//!
//! - Each [`Ball`] is registered in the bus' [`CallerMap`](crate::event::CallerMap)
//!   and integrates its own position on [`ENTER`].
//! - Hitting an arena wall triggers [`BOUNCE`] on that ball, from inside the
//!   ENTER dispatch.
//! - Every bounce is reported on the global [`SCORE`] event to a
//!   [`Scoreboard`] bound persistently, so it survives scene resets.
//! - A ball that has used up its bounces leaves the caller map and drops all
//!   of its bindings.

use crossbeam_channel::bounded;
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::event::{
    Bus, BusStats, Caller, CallerID, ENTER, EnterPayload, EventID, Response,
    register_event,
};

/// Triggered on a ball when it hits a wall.
pub static BOUNCE: LazyLock<EventID<Bounce>> = LazyLock::new(register_event);
/// Triggered globally for every bounce.
pub static SCORE: LazyLock<EventID<Score>> = LazyLock::new(register_event);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Wall {
    Left,
    Right,
    Top,
    Bottom,
}

/// Payload of [`BOUNCE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounce {
    pub wall: Wall,
    pub frame: u64,
}

/// Payload of [`SCORE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Score {
    pub ball: CallerID,
    /// `true` if this was the ball's last bounce.
    pub retired: bool,
}

/// Playfield size in pixels. Balls bounce off all four edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Arena {
    pub width: f32,
    pub height: f32,
}

impl Default for Arena {
    fn default() -> Self {
        Self {
            width: 320.0,
            height: 180.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Body {
    pos: (f32, f32),
    vel: (f32, f32),
}

/// A ball entity.
pub struct Ball {
    cid: CallerID,
    body: Mutex<Body>,
    bounces_left: AtomicU32,
}

impl Caller for Ball {
    fn cid(&self) -> CallerID {
        self.cid
    }
}

impl Ball {
    pub fn new(cid: CallerID, pos: (f32, f32), vel: (f32, f32), bounces: u32) -> Self {
        Self {
            cid,
            body: Mutex::new(Body { pos, vel }),
            bounces_left: AtomicU32::new(bounces),
        }
    }

    pub fn position(&self) -> (f32, f32) {
        self.body.lock().pos
    }

    pub fn bounces_left(&self) -> u32 {
        self.bounces_left.load(Ordering::SeqCst)
    }

    /// Move by `dt` seconds, reflecting off the arena edges.
    ///
    /// Returns the first wall hit during this step, if any.
    pub fn advance(&self, dt: f32, arena: Arena) -> Option<Wall> {
        let mut body = self.body.lock();
        body.pos.0 += body.vel.0 * dt;
        body.pos.1 += body.vel.1 * dt;

        let mut hit = None;
        if body.pos.0 < 0.0 {
            body.pos.0 = -body.pos.0;
            body.vel.0 = -body.vel.0;
            hit = Some(Wall::Left);
        } else if body.pos.0 > arena.width {
            body.pos.0 = 2.0 * arena.width - body.pos.0;
            body.vel.0 = -body.vel.0;
            hit = Some(Wall::Right);
        }
        if body.pos.1 < 0.0 {
            body.pos.1 = -body.pos.1;
            body.vel.1 = -body.vel.1;
            hit = hit.or(Some(Wall::Top));
        } else if body.pos.1 > arena.height {
            body.pos.1 = 2.0 * arena.height - body.pos.1;
            body.vel.1 = -body.vel.1;
            hit = hit.or(Some(Wall::Bottom));
        }
        hit
    }

    /// Use up one bounce and return how many are left.
    fn spend_bounce(&self) -> u32 {
        let prev = self
            .bounces_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }
}

/// Random speed between 80 and 160 px/s in either direction.
fn random_speed(rng: &mut fastrand::Rng) -> f32 {
    let v = 80.0 + rng.f32() * 80.0;
    if rng.bool() { v } else { -v }
}

/// Running totals fed by [`SCORE`].
#[derive(Debug, Default)]
pub struct Scoreboard {
    bounces: AtomicU64,
    retired: AtomicU64,
}

impl Scoreboard {
    fn record(&self, score: &Score) {
        self.bounces.fetch_add(1, Ordering::SeqCst);
        if score.retired {
            self.retired.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn bounces(&self) -> u64 {
        self.bounces.load(Ordering::SeqCst)
    }

    pub fn retired(&self) -> u64 {
        self.retired.load(Ordering::SeqCst)
    }
}

/// Summary of a scene run.
#[derive(Debug, Clone, Serialize)]
pub struct SceneReport {
    pub frames: u64,
    pub bounces: u64,
    pub retired: u64,
    pub live_balls: usize,
    pub bus: BusStats,
}

/// The bouncing-balls scene. Owns its balls; the bus only refers to them.
pub struct Scene {
    bus: Bus,
    arena: Arena,
    balls: Vec<Arc<Ball>>,
    scoreboard: Arc<Scoreboard>,
}

impl Scene {
    /// Create an empty scene and bind its scoreboard persistently.
    pub fn new(bus: &Bus, arena: Arena) -> Self {
        let scoreboard = Arc::new(Scoreboard::default());
        let board = Arc::clone(&scoreboard);
        bus.persistent_bind(*SCORE, CallerID::GLOBAL, move |_, score| {
            board.record(score);
            Response::NONE
        });
        Self {
            bus: bus.clone(),
            arena,
            balls: Vec::new(),
            scoreboard,
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn scoreboard(&self) -> &Scoreboard {
        &self.scoreboard
    }

    pub fn balls(&self) -> &[Arc<Ball>] {
        &self.balls
    }

    /// Balls still registered in the caller map.
    pub fn live_balls(&self) -> usize {
        let map = self.bus.caller_map();
        self.balls.iter().filter(|b| map.has_entity(b.cid())).count()
    }

    /// Spawn `count` balls at random positions and speeds, each allowed
    /// `max_bounces` bounces.
    pub fn spawn_balls(&mut self, count: usize, max_bounces: u32, rng: &mut fastrand::Rng) {
        for _ in 0..count {
            let pos = (
                rng.f32() * self.arena.width,
                rng.f32() * self.arena.height,
            );
            let vel = (random_speed(rng), random_speed(rng));
            self.spawn_ball(pos, vel, max_bounces);
        }
        info!("Spawned {} ball(s)", count);
    }

    /// Spawn one ball and bind its behaviour.
    pub fn spawn_ball(&mut self, pos: (f32, f32), vel: (f32, f32), max_bounces: u32) -> Arc<Ball> {
        let ball = self
            .bus
            .caller_map()
            .register_with(|cid| Ball::new(cid, pos, vel, max_bounces));

        let arena = self.arena;
        let weak = self.bus.downgrade();
        self.bus
            .bind_entity(ENTER, &ball, move |ball: &Ball, enter: &EnterPayload| {
                let dt = enter.since_last_frame.as_secs_f32();
                if let Some(wall) = ball.advance(dt, arena)
                    && let Some(bus) = weak.upgrade()
                {
                    let bounce = Bounce {
                        wall,
                        frame: enter.frames_elapsed,
                    };
                    bus.trigger(*BOUNCE, ball.cid(), &bounce);
                }
                Response::NONE
            });

        let weak = self.bus.downgrade();
        self.bus
            .bind_entity(*BOUNCE, &ball, move |ball: &Ball, bounce: &Bounce| {
                let Some(bus) = weak.upgrade() else {
                    return Response::NONE;
                };
                let left = ball.spend_bounce();
                let retired = left == 0;
                bus.trigger_global(
                    *SCORE,
                    &Score {
                        ball: ball.cid(),
                        retired,
                    },
                );
                if !retired {
                    return Response::NONE;
                }
                debug!(
                    "{} retired on {:?} wall at frame {}",
                    ball.cid(),
                    bounce.wall,
                    bounce.frame
                );
                bus.caller_map().remove_entity(ball.cid());
                bus.unbind_all_from(ball.cid());
                Response::UNBIND_THIS_CALLER
            });

        self.balls.push(Arc::clone(&ball));
        ball
    }

    /// Step the scene by hand for `frames` frames of `frame_delay` simulated
    /// time each. Deterministic for a given seed.
    pub fn run(&mut self, frames: u64, frame_delay: Duration) -> SceneReport {
        let mut payload = EnterPayload::default();
        for _ in 0..frames {
            payload = payload.next(frame_delay, frame_delay);
            self.bus.broadcast(ENTER, &payload);
            // Retirements queued during the frame take effect before the next one.
            self.bus.flush();
        }
        self.report(payload.frames_elapsed)
    }

    /// Drive the scene from [`Bus::enter_loop`] in real time until `frames`
    /// frames have been triggered.
    pub fn run_realtime(&mut self, frames: u64, frame_delay: Duration) -> SceneReport {
        if frames == 0 {
            return self.report(0);
        }
        let (tx_done, rx_done) = bounded::<u64>(1);
        self.bus
            .global_bind(ENTER, move |enter: &EnterPayload| {
                if enter.frames_elapsed < frames {
                    return Response::NONE;
                }
                let _ = tx_done.try_send(enter.frames_elapsed);
                Response::UNBIND_THIS_BINDING
            });
        self.bus.flush();

        let enter = self.bus.enter_loop(frame_delay);
        let reached = rx_done.recv().unwrap_or(0);
        let triggered = enter.stop();
        self.bus.flush();
        debug!("Enter loop triggered {} frame(s), target reached at {}", triggered, reached);
        self.report(triggered)
    }

    pub fn report(&self, frames: u64) -> SceneReport {
        SceneReport {
            frames,
            bounces: self.scoreboard.bounces(),
            retired: self.scoreboard.retired(),
            live_balls: self.live_balls(),
            bus: self.bus.stats(),
        }
    }

    /// Clear the scene: reset the bus (the scoreboard comes back) and forget
    /// every ball.
    pub fn teardown(&mut self) {
        self.bus.reset();
        self.bus.caller_map().clear();
        self.balls.clear();
        self.bus.flush();
        info!("Scene cleared");
    }
}
