//! # godis
//!
//! A small single-threaded in-memory key-value server speaking a RESP-style
//! protocol.
//!
//! ```text
//!   socket ──> EventLoop (epoll + timers)
//!                 │ readable                      │ cron
//!                 ▼                               ▼
//!         Buffer ─> QueryParser ─> CommandTable ─> Db ──> Dict / SkipList
//!                                       │
//!                                       ▼
//!                                   ReplyQueue ──> socket (on writable)
//! ```
//!
//! The core data structures are usable on their own:
//!
//! ```
//! use godis::dict::Dict;
//! use godis::skiplist::SkipList;
//!
//! let mut d: Dict<String, u32> = Dict::default();
//! d.set("a".to_string(), 1);
//! assert_eq!(d.get(&"a".to_string()), Some(&1));
//!
//! let mut zsl: SkipList<String> = SkipList::default();
//! zsl.insert(2.0, "b".to_string());
//! zsl.insert(1.0, "a".to_string());
//! let names: Vec<_> = zsl.range(0, -1).map(|(e, _)| e.clone()).collect();
//! assert_eq!(names, ["a", "b"]);
//! ```

pub mod ae;
pub mod buffer;
pub mod command;
pub mod config;
pub mod db;
pub mod dict;
pub mod error;
pub mod object;
pub mod protocol;
pub mod reply;
pub mod server;
pub mod skiplist;

pub use config::Config;
pub use error::{DictError, ProtocolError, ServerError};
pub use server::Server;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
