#![doc = include_str!("../README.md")]

pub mod bitmap;
pub mod key;
pub mod smalllist;

mod epoch;
mod mutate;
mod navigate;
mod node;
mod trie;

pub use key::OrderedKey;
pub use trie::{Iter, Trie};

#[cfg(not(target_pointer_width = "64"))]
compile_error!("cowtrie packed node headers require 64-bit targets");
