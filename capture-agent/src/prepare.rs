// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture preparation
//!
//! Before the backbuffer is read, simulation time is frozen for a few
//! frames (so frame generation settles) and the host UI is hidden. The
//! controller is advanced from the host's frame hooks:
//!
//! ```text
//! update()          state transitions, may emit PrepareEvent::Launch
//! late_update()     freezes / restores the simulation clock
//! end_rendering()   counts the rendered frame
//! ```

use log::{debug, warn};

use crate::config::{CaptureSettings, PrepareOrder};
use crate::error::Result;
use crate::protocol::{FROZEN_TIME_SCALE, HIDE_PROGRESS_THRESHOLD};
use crate::ui::UiHider;

/// Access to the host's global simulation speed
pub trait SimulationClock {
    fn global_speed(&mut self) -> Result<f32>;

    fn set_global_speed(&mut self, speed: f32) -> Result<()>;
}

/// Preparation state
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PrepareState {
    #[default]
    Idle,
    FreezeScene,
    WaitingHideUI,
    Complete,
}

impl PrepareState {
    /// Position of the state within a cycle run in `order`
    pub fn rank(self, order: PrepareOrder) -> u8 {
        match (self, order) {
            (PrepareState::Idle, _) => 0,
            (PrepareState::FreezeScene, PrepareOrder::FreezeThenHide)
            | (PrepareState::WaitingHideUI, PrepareOrder::HideThenFreeze) => 1,
            (PrepareState::WaitingHideUI, PrepareOrder::FreezeThenHide)
            | (PrepareState::FreezeScene, PrepareOrder::HideThenFreeze) => 2,
            (PrepareState::Complete, _) => 3,
        }
    }
}

/// Emitted by [`PrepareController::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareEvent {
    /// The scene is ready, trigger the capture now
    Launch,
}

/// Tunables of the preparation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareConfig {
    pub order: PrepareOrder,
    /// Frames to freeze, already clamped
    pub freeze_frames: i32,
    /// Frames to hide the UI for in hide-first order, `None` until released
    pub hide_frames: Option<i32>,
    /// Freeze after hiding in hide-first order
    pub fix_artifacts: bool,
    /// Log every tick
    pub trace: bool,
}

impl From<&CaptureSettings> for PrepareConfig {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            order: settings.prepare_order,
            freeze_frames: settings.freeze_budget(),
            hide_frames: settings.hide_ui_frames,
            fix_artifacts: settings.fix_artifacts,
            trace: settings.heavy_debug_logging,
        }
    }
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self::from(&CaptureSettings::default())
    }
}

/// Frame-staged preparation state machine
#[derive(Debug)]
pub struct PrepareController {
    config: PrepareConfig,
    state: PrepareState,
    freeze_total: i32,
    /// Frames of freeze left, -1 when not freezing
    freeze_left: i32,
    cached_speed: Option<f32>,
    ui: UiHider,
    holding_camera: bool,
}

impl PrepareController {
    pub fn new(config: PrepareConfig) -> Self {
        Self {
            config,
            state: PrepareState::Idle,
            freeze_total: config.freeze_frames,
            freeze_left: -1,
            cached_speed: None,
            ui: UiHider::new(),
            holding_camera: false,
        }
    }

    pub fn state(&self) -> PrepareState {
        self.state
    }

    pub fn order(&self) -> PrepareOrder {
        self.config.order
    }

    pub fn ui(&self) -> &UiHider {
        &self.ui
    }

    pub fn is_freezing(&self) -> bool {
        self.freeze_left >= 0
    }

    /// Whether the host camera update should be skipped
    pub fn holds_camera(&self) -> bool {
        self.holding_camera
    }

    /// Start a preparation cycle. Rejected unless idle.
    pub fn begin(&mut self) -> bool {
        if self.state != PrepareState::Idle {
            debug!("Prepare already running in {:?}", self.state);
            return false;
        }

        self.holding_camera = true;
        match self.config.order {
            PrepareOrder::FreezeThenHide => {
                self.start_freeze();
                self.ui.hide_for(self.freeze_total);
                self.transition(PrepareState::FreezeScene);
            }
            PrepareOrder::HideThenFreeze => {
                // The hide has to outlast the freeze that follows it
                let frames = match self.config.hide_frames {
                    Some(frames) if self.config.fix_artifacts => {
                        frames.max(0) + self.config.freeze_frames
                    }
                    Some(frames) => frames.max(0),
                    None => -1,
                };
                self.ui.hide_for(frames);
                self.transition(PrepareState::WaitingHideUI);
            }
        }
        true
    }

    /// Per-frame update. Returns [`PrepareEvent::Launch`] on the tick the
    /// capture should be triggered.
    pub fn update(&mut self) -> Option<PrepareEvent> {
        self.ui.update();

        if self.config.trace && self.state != PrepareState::Idle {
            debug!(
                "Prepare tick: {:?}, freeze {}/{}, hide progress {:.2}",
                self.state,
                self.freeze_left,
                self.freeze_total,
                self.ui.progress()
            );
        }

        // Fall through as long as the next exit condition already holds
        loop {
            let next = match self.state {
                PrepareState::Idle => return None,
                PrepareState::FreezeScene => {
                    if !self.freeze_at_terminal_frame() {
                        return None;
                    }
                    match self.config.order {
                        PrepareOrder::FreezeThenHide => PrepareState::WaitingHideUI,
                        PrepareOrder::HideThenFreeze => PrepareState::Complete,
                    }
                }
                PrepareState::WaitingHideUI => {
                    if self.ui.progress() < HIDE_PROGRESS_THRESHOLD {
                        return None;
                    }
                    match self.config.order {
                        PrepareOrder::HideThenFreeze if self.config.fix_artifacts => {
                            self.start_freeze();
                            PrepareState::FreezeScene
                        }
                        _ => PrepareState::Complete,
                    }
                }
                PrepareState::Complete => {
                    self.transition(PrepareState::Idle);
                    return Some(PrepareEvent::Launch);
                }
            };
            self.transition(next);
        }
    }

    /// Freeze or restore simulation time
    pub fn late_update(&mut self, clock: &mut dyn SimulationClock) -> Result<()> {
        if self.freeze_left < 0 {
            return Ok(());
        }

        let cached = match self.cached_speed {
            Some(speed) => speed,
            None => {
                let speed = clock.global_speed()?;
                self.cached_speed = Some(speed);
                speed
            }
        };

        if self.freeze_left == 0 {
            debug!("Restoring simulation speed {cached}");
            self.cached_speed = None;
            clock.set_global_speed(cached)
        } else {
            clock.set_global_speed(FROZEN_TIME_SCALE)
        }
    }

    /// Count a rendered frame
    pub fn end_rendering(&mut self) {
        if self.freeze_left >= 0 {
            self.freeze_left -= 1;
        }
        self.ui.end_rendering();
    }

    /// The capture this cycle launched has been read back (or failed)
    pub fn finish(&mut self) {
        self.holding_camera = false;
        if self.ui.is_indefinite() {
            self.ui.release();
        }
    }

    /// Abandon the cycle, restoring the simulation speed if it was frozen
    pub fn abort(&mut self, clock: &mut dyn SimulationClock) {
        if let Some(speed) = self.cached_speed.take()
            && let Err(e) = clock.set_global_speed(speed)
        {
            warn!("Could not restore simulation speed: {e}");
        }

        self.state = PrepareState::Idle;
        self.freeze_left = -1;
        self.holding_camera = false;
        self.ui.release();
    }

    fn start_freeze(&mut self) {
        self.freeze_total = self.config.freeze_frames;
        self.freeze_left = self.freeze_total;
    }

    /// One frame before the freeze runs out
    fn freeze_at_terminal_frame(&self) -> bool {
        self.freeze_total - self.freeze_left >= self.freeze_total - 1
    }

    fn transition(&mut self, next: PrepareState) {
        debug_assert!(
            next == PrepareState::Idle
                || next.rank(self.config.order) > self.state.rank(self.config.order),
            "prepare went backwards: {:?} -> {next:?}",
            self.state
        );
        debug!("Prepare {:?} -> {next:?}", self.state);
        self.state = next;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::CaptureError;

    /// Clock recording every speed it was given
    #[derive(Debug)]
    pub struct FakeClock {
        pub speed: f32,
        pub history: Vec<f32>,
        pub fail: bool,
    }

    impl FakeClock {
        pub fn new(speed: f32) -> Self {
            Self {
                speed,
                history: Vec::new(),
                fail: false,
            }
        }
    }

    impl SimulationClock for FakeClock {
        fn global_speed(&mut self) -> Result<f32> {
            if self.fail {
                return Err(CaptureError::HostField("get_GlobalSpeed".into()));
            }
            Ok(self.speed)
        }

        fn set_global_speed(&mut self, speed: f32) -> Result<()> {
            self.speed = speed;
            self.history.push(speed);
            Ok(())
        }
    }

    fn config(order: PrepareOrder) -> PrepareConfig {
        PrepareConfig {
            order,
            freeze_frames: 5,
            hide_frames: Some(6),
            fix_artifacts: true,
            trace: false,
        }
    }

    /// Run frames until launch, returning the states seen and the frame count
    fn run_to_launch(
        controller: &mut PrepareController,
        clock: &mut FakeClock,
    ) -> (Vec<PrepareState>, usize) {
        let mut states = vec![controller.state()];
        for frame in 0..100 {
            let event = controller.update();
            states.push(controller.state());
            if event == Some(PrepareEvent::Launch) {
                return (states, frame);
            }
            controller.late_update(clock).unwrap();
            controller.end_rendering();
        }
        panic!("prepare never launched, states {states:?}");
    }

    #[test]
    fn test_begin_rejected_while_busy() {
        let mut controller = PrepareController::new(config(PrepareOrder::FreezeThenHide));
        assert!(controller.begin());
        assert!(!controller.begin());
        assert_eq!(controller.state(), PrepareState::FreezeScene);
        assert!(controller.holds_camera());
        assert!(controller.ui().is_hiding());
    }

    #[test]
    fn test_freeze_then_hide_sequence() {
        let mut controller = PrepareController::new(config(PrepareOrder::FreezeThenHide));
        let mut clock = FakeClock::new(1.0);
        controller.begin();

        let (states, frame) = run_to_launch(&mut controller, &mut clock);

        // Four frames of freeze before the terminal frame is reached
        assert_eq!(frame, 4);
        assert_eq!(controller.state(), PrepareState::Idle);
        assert!(states.contains(&PrepareState::FreezeScene));
        // Every intermediate frame was frozen
        assert!(clock.history.iter().all(|s| *s == FROZEN_TIME_SCALE));
        assert_eq!(clock.history.len(), 4);
    }

    #[test]
    fn test_prepare_is_monotonic_in_both_orders() {
        for order in [PrepareOrder::FreezeThenHide, PrepareOrder::HideThenFreeze] {
            let mut controller = PrepareController::new(config(order));
            let mut clock = FakeClock::new(1.0);
            controller.begin();

            let (states, _) = run_to_launch(&mut controller, &mut clock);
            let ranks: Vec<u8> = states[..states.len() - 1]
                .iter()
                .map(|s| s.rank(order))
                .collect();

            assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "{order:?}: {states:?}");
            assert_eq!(states.last(), Some(&PrepareState::Idle));
        }
    }

    #[test]
    fn test_hide_then_freeze_passes_through_freeze() {
        let mut controller = PrepareController::new(config(PrepareOrder::HideThenFreeze));
        let mut clock = FakeClock::new(1.0);
        assert!(controller.begin());
        assert_eq!(controller.state(), PrepareState::WaitingHideUI);
        assert!(!controller.is_freezing());

        let (states, _) = run_to_launch(&mut controller, &mut clock);

        assert!(states.contains(&PrepareState::FreezeScene));
        // UI stays hidden through the freeze
        assert!(controller.ui().is_hiding());
        assert!(!clock.history.is_empty());
    }

    #[test]
    fn test_hide_then_freeze_without_artifact_fix() {
        let mut cfg = config(PrepareOrder::HideThenFreeze);
        cfg.fix_artifacts = false;
        let mut controller = PrepareController::new(cfg);
        let mut clock = FakeClock::new(1.0);
        controller.begin();

        let (states, frame) = run_to_launch(&mut controller, &mut clock);

        // Half of six hide frames
        assert_eq!(frame, 3);
        assert!(!states.contains(&PrepareState::FreezeScene));
        assert!(clock.history.is_empty());
    }

    #[test]
    fn test_indefinite_hide_released_on_finish() {
        let mut cfg = config(PrepareOrder::HideThenFreeze);
        cfg.hide_frames = None;
        cfg.fix_artifacts = false;
        let mut controller = PrepareController::new(cfg);
        let mut clock = FakeClock::new(1.0);
        controller.begin();

        run_to_launch(&mut controller, &mut clock);
        assert!(controller.ui().is_indefinite());

        controller.finish();
        assert!(!controller.ui().is_hiding());
        assert!(!controller.holds_camera());
    }

    #[test]
    fn test_timescale_restored_after_freeze() {
        let mut controller = PrepareController::new(config(PrepareOrder::FreezeThenHide));
        let mut clock = FakeClock::new(0.75);
        controller.begin();

        for _ in 0..20 {
            controller.update();
            controller.late_update(&mut clock).unwrap();
            controller.end_rendering();
        }

        assert_eq!(clock.speed, 0.75);
        assert_eq!(clock.history.last(), Some(&0.75));
        assert_eq!(clock.history.iter().filter(|s| **s == 0.75).count(), 1);
        assert!(!controller.is_freezing());
    }

    #[test]
    fn test_abort_restores_speed() {
        let mut controller = PrepareController::new(config(PrepareOrder::FreezeThenHide));
        let mut clock = FakeClock::new(2.0);
        controller.begin();
        controller.update();
        controller.late_update(&mut clock).unwrap();
        assert_eq!(clock.speed, FROZEN_TIME_SCALE);

        controller.abort(&mut clock);

        assert_eq!(clock.speed, 2.0);
        assert_eq!(controller.state(), PrepareState::Idle);
        assert!(!controller.ui().is_hiding());
        assert!(controller.begin());
    }

    #[test]
    fn test_clock_failure_is_reported() {
        let mut controller = PrepareController::new(config(PrepareOrder::FreezeThenHide));
        let mut clock = FakeClock::new(1.0);
        clock.fail = true;
        controller.begin();

        assert!(matches!(
            controller.late_update(&mut clock),
            Err(CaptureError::HostField(_))
        ));
    }

    #[test]
    fn test_freeze_budget_from_settings() {
        let settings = CaptureSettings {
            freeze_frames: 2,
            ..Default::default()
        };
        let cfg = PrepareConfig::from(&settings);
        assert_eq!(cfg.freeze_frames, 4);
    }
}
