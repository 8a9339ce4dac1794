// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command admission and priority scheduling for storage adapters.
//!
//! Commands are ordered per device in a [queue::PriorityQueue], throttled by
//! the device's openings ([devq::DeviceQueue]) and again by the openings of
//! the adapter they are dispatched through ([sendq::SendQueue]).  The
//! [perimeter::Perimeter] ties those together under one lock, and the
//! [adapter::AdapterHandle] represents the driver the commands go to.

#![allow(clippy::style)]

pub extern crate usdt;

pub mod adapter;
pub mod devq;
pub mod perimeter;
pub mod queue;
pub mod sendq;
pub mod util;

pub use adapter::{
    Adapter, AdapterHandle, AdapterParams, AdapterRef, DeviceParams,
    LockStrategy, QueueDisposition,
};
pub use perimeter::{Dispatched, Perimeter, PerimeterLock};
pub use queue::{EntryId, Priority};
pub use util::id::{AdapterId, DeviceId};

pub fn version() -> &'static str {
    lazy_static::lazy_static! {
        static ref VERSION: String = {
            use std::fmt::Write;

            let git = option_env!("VERGEN_GIT_BRANCH")
                .and_then(|branch| Some((branch, option_env!("VERGEN_GIT_SHA")?)));

            let mut version = format!("v{}", env!("CARGO_PKG_VERSION"));
            if let Some((branch, sha)) = git {
                write!(version, " ({sha}) {branch}")
                    .expect("writing to a string never fails");
            } else {
                version.push_str(" <unknown git commit>");
            }
            version
        };
    };
    &VERSION
}
