// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

//! Moments, for counter accounting.

use core::ops::Add;
use core::time::Duration;
use std::time::Instant;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;

/// A moment in time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Moment {
    inner: Instant,
}

impl Add<Duration> for Moment {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Moment { inner: self.inner + rhs }
    }
}

impl Moment {
    /// Compute the delta between `self - earlier` and return it as
    /// milliseconds.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        let delta = self.inner.duration_since(earlier.inner);
        delta.as_secs() * MILLIS + u64::from(delta.subsec_millis())
    }

    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }
}

impl Default for Moment {
    fn default() -> Self {
        Self::now()
    }
}
