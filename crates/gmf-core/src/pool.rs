//! Registry of element and IO factories.
//!
//! A [`Pool`] builds pipelines from tags: each registered tag maps to a
//! factory that makes a fresh instance, so one pool can assemble any number
//! of independent pipelines.
//!
//! ```rust
//! use gmf_core::{Pool, new_ringbuf};
//!
//! let mut pool = Pool::with_builtin();
//! let src = new_ringbuf(1, 4096).unwrap();
//! let dst = new_ringbuf(1, 4096).unwrap();
//! pool.register_bus_io("src", src);
//! pool.register_bus_io("dst", dst);
//! let pipeline = pool.new_pipeline(Some("src"), &["copy", "gain"], Some("dst")).unwrap();
//! assert_eq!(pipeline.element_tags(), vec!["copy", "gain"]);
//! ```

use std::sync::Arc;

use crate::data_bus::DataBus;
use crate::element::Element;
use crate::elements::{CopyElement, FramerElement, GainElement};
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::port::{BusReader, BusWriter, PortIo};

/// Builds an element given its tag.
pub type ElementFactory = Box<dyn Fn(&str) -> Element + Send + Sync>;

/// Builds an IO for the given direction (`true` for input).
pub type IoFactory = Box<dyn Fn(bool) -> Arc<dyn PortIo> + Send + Sync>;

/// Describes a registered element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementDescriptor {
    /// Lookup tag.
    pub tag: String,
    /// One-line description.
    pub description: String,
}

struct ElementEntry {
    descriptor: ElementDescriptor,
    factory: ElementFactory,
}

struct IoEntry {
    tag: String,
    factory: IoFactory,
}

/// Element and IO factories by tag.
#[derive(Default)]
pub struct Pool {
    elements: Vec<ElementEntry>,
    ios: Vec<IoEntry>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("elements", &self.element_tags())
            .field("ios", &self.ios.iter().map(|io| io.tag.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

/// Default per-call data size of stock elements.
pub const DEFAULT_DATA_SIZE: usize = 1024;

impl Pool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool with the stock elements: `copy`, `gain` (0 dB) and `framer`
    /// (512-byte frames).
    pub fn with_builtin() -> Self {
        let mut pool = Self::new();
        pool.register_builtin();
        pool
    }

    fn register_builtin(&mut self) {
        let entries: [(&str, &str, ElementFactory); 3] = [
            (
                "copy",
                "Forwards input unchanged",
                Box::new(|tag: &str| CopyElement::element(tag, DEFAULT_DATA_SIZE)),
            ),
            (
                "gain",
                "Scales 16-bit PCM by a gain in dB",
                Box::new(|tag: &str| GainElement::element(tag, DEFAULT_DATA_SIZE, 0.0)),
            ),
            (
                "framer",
                "Re-chunks input into fixed 512-byte frames",
                Box::new(|tag: &str| FramerElement::element(tag, DEFAULT_DATA_SIZE, 512)),
            ),
        ];
        for (tag, description, factory) in entries {
            self.elements.push(ElementEntry {
                descriptor: ElementDescriptor {
                    tag: tag.to_owned(),
                    description: description.to_owned(),
                },
                factory,
            });
        }
    }

    /// Registers an element factory.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] if the tag is taken.
    pub fn register_element<F>(&mut self, tag: &str, description: &str, factory: F) -> Result<()>
    where
        F: Fn(&str) -> Element + Send + Sync + 'static,
    {
        if self.elements.iter().any(|e| e.descriptor.tag == tag) {
            return Err(Error::AlreadyExists(format!("element {tag}")));
        }
        tracing::debug!(tag, "element registered");
        self.elements.push(ElementEntry {
            descriptor: ElementDescriptor {
                tag: tag.to_owned(),
                description: description.to_owned(),
            },
            factory: Box::new(factory),
        });
        Ok(())
    }

    /// Registers `bus` as an IO: a reader when used as input, a writer as
    /// output. A tag that is already taken is replaced.
    pub fn register_bus_io(&mut self, tag: &str, bus: Arc<dyn DataBus>) {
        self.ios.retain(|io| io.tag != tag);
        self.ios.push(IoEntry {
            tag: tag.to_owned(),
            factory: Box::new(move |is_input| -> Arc<dyn PortIo> {
                if is_input {
                    Arc::new(BusReader(Arc::clone(&bus)))
                } else {
                    Arc::new(BusWriter(Arc::clone(&bus)))
                }
            }),
        });
    }

    /// Registered element tags.
    pub fn element_tags(&self) -> Vec<&str> {
        self.elements.iter().map(|e| e.descriptor.tag.as_str()).collect()
    }

    /// Registered element descriptors.
    pub fn descriptors(&self) -> impl Iterator<Item = &ElementDescriptor> {
        self.elements.iter().map(|e| &e.descriptor)
    }

    /// Makes a new element by tag (case-insensitive).
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown tag.
    pub fn new_element(&self, tag: &str) -> Result<Element> {
        self.elements
            .iter()
            .find(|e| e.descriptor.tag.eq_ignore_ascii_case(tag))
            .map(|e| (e.factory)(&e.descriptor.tag))
            .ok_or_else(|| Error::not_found(format!("element {tag}")))
    }

    /// Makes a new IO by tag.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown tag.
    pub fn new_io(&self, tag: &str, is_input: bool) -> Result<Arc<dyn PortIo>> {
        self.ios
            .iter()
            .find(|io| io.tag == tag)
            .map(|io| (io.factory)(is_input))
            .ok_or_else(|| Error::not_found(format!("io {tag}")))
    }

    /// Builds a pipeline from registered tags.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for any unknown tag; pipeline construction errors.
    pub fn new_pipeline(&self, in_io: Option<&str>, elements: &[&str], out_io: Option<&str>) -> Result<Pipeline> {
        let in_io = in_io.map(|tag| self.new_io(tag, true)).transpose()?;
        let out_io = out_io.map(|tag| self.new_io(tag, false)).transpose()?;
        self.new_pipeline_with(in_io, elements, out_io)
    }

    /// Builds a pipeline from registered elements between caller-made IOs.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for any unknown element tag; pipeline
    /// construction errors.
    pub fn new_pipeline_with(
        &self,
        in_io: Option<Arc<dyn PortIo>>,
        elements: &[&str],
        out_io: Option<Arc<dyn PortIo>>,
    ) -> Result<Pipeline> {
        let chain = elements
            .iter()
            .map(|tag| self.new_element(tag))
            .collect::<Result<Vec<_>>>()?;
        Pipeline::new(elements.join("+"), chain, in_io, out_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_bus::new_ringbuf;
    use crate::element::{ElementConfig, ElementCore, ElementOps};
    use crate::job::JobStatus;

    #[test]
    fn builtin_elements_are_listed() {
        let pool = Pool::with_builtin();
        assert_eq!(pool.element_tags(), vec!["copy", "gain", "framer"]);
        assert!(pool.descriptors().all(|d| !d.description.is_empty()));
        assert_eq!(pool.new_element("GAIN").unwrap().tag(), "gain");
    }

    #[test]
    fn unknown_tags_are_not_found() {
        let mut pool = Pool::with_builtin();
        pool.register_bus_io("bus", new_ringbuf(1, 64).unwrap());
        assert!(matches!(pool.new_element("reverb"), Err(Error::NotFound(_))));
        assert!(matches!(
            pool.new_pipeline(Some("bus"), &["copy", "reverb"], None),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            pool.new_pipeline(Some("nope"), &["copy"], None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        struct Nop;
        impl ElementOps for Nop {
            fn open(&mut self, _: &mut ElementCore) -> JobStatus {
                JobStatus::Ok
            }
            fn process(&mut self, _: &mut ElementCore) -> JobStatus {
                JobStatus::Done
            }
            fn close(&mut self, _: &mut ElementCore) -> JobStatus {
                JobStatus::Ok
            }
        }
        let mut pool = Pool::new();
        pool.register_element("nop", "does nothing", |tag| {
            Element::new(tag, ElementConfig::default(), Box::new(Nop))
        })
        .unwrap();
        assert!(matches!(
            pool.register_element("nop", "again", |tag| Element::new(tag, ElementConfig::default(), Box::new(Nop))),
            Err(Error::AlreadyExists(_))
        ));
        let p = pool.new_pipeline_with(None, &["nop", "nop"], None).unwrap();
        assert_eq!(p.name(), "nop+nop");
    }
}
