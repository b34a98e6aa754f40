// SPDX-License-Identifier: MIT OR Apache-2.0

#[cfg(test)]
mod tests;

pub mod client;
pub mod consts;
pub mod disk;
pub mod fs;
pub mod wire;
