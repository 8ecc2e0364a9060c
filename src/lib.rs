// SPDX-License-Identifier: Apache-2.0

pub mod agent;
pub mod bounded_channel;
pub mod entry;
pub mod error;
pub mod operator;
pub mod persistence;
pub mod pipeline;
pub mod plugin;

pub use agent::{Agent, Config};
pub use entry::{Entry, Field};
pub use error::{Error, Result};
