// Copyright (C) 2023, Alex Badics
// This file is part of usbg-harness
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Ctrl-C handling around the read loop.

use std::{
    ffi::c_int,
    sync::atomic::{AtomicBool, Ordering},
};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::Result;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// The flag set by the SIGINT handler.
pub fn flag() -> &'static AtomicBool {
    &INTERRUPTED
}

/// SIGINT handler that lives as long as the value. The previous disposition
/// is restored on drop.
#[derive(Debug)]
pub struct SigintTrap {
    previous: SigAction,
}

impl SigintTrap {
    pub fn install() -> Result<Self> {
        INTERRUPTED.store(false, Ordering::SeqCst);
        // No SA_RESTART: a blocking transfer has to come back with EINTR
        let action = SigAction::new(
            SigHandler::Handler(on_sigint),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let previous = unsafe { sigaction(Signal::SIGINT, &action)? };
        Ok(Self { previous })
    }
}

impl Drop for SigintTrap {
    fn drop(&mut self) {
        let _ = unsafe { sigaction(Signal::SIGINT, &self.previous) };
    }
}
