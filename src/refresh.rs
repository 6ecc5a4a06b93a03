use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::annotation::format_annotation;
use crate::artists::{ArtistManager, RenderSurface};
use crate::error::RefreshError;
use crate::snapshot::{SnapshotRequest, SnapshotSource};

/// Write-once stop signal shared between the window and the refresh loop.
///
/// Starts uncancelled, flips at most once and never flips back.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that actually flipped the token.
    pub fn cancel(&self) -> bool {
        self.flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSummary {
    /// Cycles that got all the way to a redraw.
    pub cycles: u64,
}

/// Fetch, format, render, yield; until the token is cancelled.
pub struct RefreshLoop<S, R> {
    source: S,
    surface: R,
    artists: ArtistManager,
    request: SnapshotRequest,
    event_wait: Duration,
    state: LoopState,
    cycles: u64,
}

impl<S: SnapshotSource, R: RenderSurface> RefreshLoop<S, R> {
    pub fn new(source: S, surface: R, request: SnapshotRequest, event_wait: Duration) -> Self {
        Self {
            source,
            surface,
            artists: ArtistManager::new(),
            request,
            event_wait,
            state: LoopState::Running,
            cycles: 0,
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn surface_mut(&mut self) -> &mut R {
        &mut self.surface
    }

    #[allow(dead_code)]
    pub fn artists(&self) -> &ArtistManager {
        &self.artists
    }

    /// Runs until `token` is cancelled or a cycle fails.
    ///
    /// A fetch already in flight when the token flips is allowed to finish, but
    /// its result is dropped instead of drawn. Any error stops the loop for good.
    pub fn run(&mut self, token: &CancellationToken) -> Result<LoopSummary, RefreshError> {
        let result = self.drive(token);
        self.state = LoopState::Stopped;
        info!(target: "refresh", "refresh loop stopped after {} cycles", self.cycles);
        result.map(|_| LoopSummary { cycles: self.cycles })
    }

    fn drive(&mut self, token: &CancellationToken) -> Result<(), RefreshError> {
        if self.state == LoopState::Stopped {
            return Ok(());
        }

        let mut window_cycles = 0u64;
        let mut window_start = Instant::now();

        while !token.is_cancelled() {
            let snapshot = self.source.fetch_snapshot(&self.request)?;
            if token.is_cancelled() {
                debug!(target: "refresh", "window closed during fetch, dropping snapshot");
                break;
            }

            let levels_db = snapshot.levels_db();
            let annotation = format_annotation(&snapshot);
            self.artists
                .refresh(&mut self.surface, &snapshot, &levels_db, &annotation)?;
            self.cycles += 1;
            window_cycles += 1;

            self.surface.process_events(self.event_wait)?;

            if window_start.elapsed() >= Duration::from_secs(5) {
                debug!(target: "refresh", "refresh stats: {} cycles in last 5 seconds", window_cycles);
                window_cycles = 0;
                window_start = Instant::now();
            }
        }
        Ok(())
    }
}
