// SPDX-License-Identifier: Apache-2.0

mod database;
mod store;

pub use database::{Database, ScopedPersister};
pub use store::{Persister, PersisterExt};
