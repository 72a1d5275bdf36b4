// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Page server transport.
//!
//! Streams snapshot pages to a remote receiver during live migration and
//! pulls them back at restore time. The wire format is private to livesnap.

mod client;
mod frame;
mod server;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Port;

pub use client::{PageServerPool, PageServerSession};
pub use frame::{read_frame, write_frame, Frame, FRAME_MAGIC, HEADER_SIZE, MAX_FRAME_SIZE};
pub use server::{PageServer, PageServerStats};

/// Address of a page server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageServerEndpoint {
    pub address: String,
    pub port: Port,
}

impl fmt::Display for PageServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') && !self.address.starts_with('[') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}
