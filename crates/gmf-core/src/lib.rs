//! GMF Core - pull-based media pipeline runtime
//!
//! Audio moves between producers and consumers in [`Payload`]s over
//! [`DataBus`]es; processing nodes ([`Element`]s) are chained into a
//! [`Pipeline`] whose jobs run on a [`Task`] worker thread.
//!
//! # Core Abstractions
//!
//! ## Data buses
//!
//! - [`new_ringbuf`] - byte ring, copies in and out
//! - [`new_block`] - contiguous arena handing out zero-copy windows
//! - [`new_pbuf`] - non-blocking queue of loaned buffers
//! - [`new_fifo`] - blocking queue of loaned buffers
//!
//! ## Processing
//!
//! - [`Port`] - an element's connection to a bus, IO or neighbour
//! - [`PayloadCache`] - fixed-size re-chunking of variable input
//! - [`Element`] / [`ElementOps`] - node lifecycle and behaviour
//! - [`Task`] - job scheduler with run / pause / resume / stop
//! - [`Pipeline`] - element chain bound to a task
//! - [`Pool`] - element and IO factories by tag
//!
//! # Example
//!
//! ```rust
//! use gmf_core::{Wait, new_block};
//!
//! let bus = new_block(256, 4).unwrap();
//! bus.write(b"hello", true, Wait::Immediate).unwrap();
//! let mut buf = [0u8; 16];
//! let (n, last) = bus.read(&mut buf, Wait::Immediate).unwrap();
//! assert_eq!(&buf[..n], b"hello");
//! assert!(last);
//! ```

pub mod cache;
pub mod cap;
pub mod data_bus;
pub mod element;
pub mod elements;
mod error;
pub mod event;
pub mod job;
pub mod payload;
pub mod pipeline;
pub mod pool;
pub mod port;
pub mod task;
mod wait;

pub use cache::{CacheChunk, PayloadCache};
pub use cap::{ArgType, ArgValue, Capability, Method, MethodArgs};
pub use data_bus::{BlockBuf, BusKind, DataBus, Fifo, PBuf, RingBuf, new_block, new_fifo, new_pbuf, new_ringbuf};
pub use element::{Element, ElementConfig, ElementCore, ElementOps, PortCaps};
pub use elements::{CopyElement, FramerElement, GainElement};
pub use error::{Error, IoError, IoResult, Result};
pub use event::{EventKind, EventPacket, EventState, SoundInfo};
pub use job::{JobStack, JobStatus, JobTimes};
pub use payload::{BufMut, BufRef, Payload};
pub use pipeline::{Pipeline, PipelineEventCb};
pub use pool::Pool;
pub use port::{BusReader, BusWriter, Endpoint, Port, PortAttr, PortDir, PortIo, PortLink};
pub use task::{Task, TaskConfig, TaskDelegate, TaskHandle};
pub use wait::Wait;
