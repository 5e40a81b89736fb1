// Copyright 2024 hq-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Host UI hide countdown

use log::debug;

use crate::protocol::INDEFINITE_HIDE_FRAMES;

/// Hides the host UI for a number of rendered frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UiHider {
    /// Frames rendered since the hide started, -1 while shown
    passed: i32,
    /// Frames to stay hidden, negative for "until released"
    total: i32,
}

impl Default for UiHider {
    fn default() -> Self {
        Self {
            passed: -1,
            total: 0,
        }
    }
}

impl UiHider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hide for `frames` rendered frames, or until [`UiHider::release`] if
    /// `frames` is negative. Ignored while already hiding.
    pub fn hide_for(&mut self, frames: i32) -> bool {
        if self.is_hiding() {
            return false;
        }
        debug!("Hiding UI for {frames} frames");
        self.passed = 0;
        self.total = frames;
        true
    }

    pub fn is_hiding(&self) -> bool {
        self.passed >= 0
    }

    pub fn is_indefinite(&self) -> bool {
        self.is_hiding() && self.total < 0
    }

    /// Fraction of the hide that has elapsed
    pub fn progress(&self) -> f32 {
        if !self.is_hiding() {
            return 0.0;
        }
        if self.total < 0 {
            return (self.passed as f32 / INDEFINITE_HIDE_FRAMES as f32).min(1.0);
        }
        if self.total == 0 {
            return 1.0;
        }
        self.passed as f32 / self.total as f32
    }

    /// Show the UI again once the countdown is over
    pub fn update(&mut self) {
        if self.is_hiding() && self.total >= 0 && self.passed > self.total {
            debug!("UI hide finished after {} frames", self.passed);
            self.passed = -1;
        }
    }

    /// Count a rendered frame
    pub fn end_rendering(&mut self) {
        if self.is_hiding() {
            self.passed = self.passed.saturating_add(1);
        }
    }

    /// End any hide immediately
    pub fn release(&mut self) {
        self.passed = -1;
    }
}
