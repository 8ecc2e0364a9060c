// SPDX-License-Identifier: Apache-2.0

mod field;
mod model;

pub use field::Field;
pub use model::Entry;
