//! Element capabilities and callable methods.
//!
//! Both are small metadata registries owned by the element: a capability
//! names a feature an element offers, a method is a named entry point with
//! typed arguments that can be invoked at runtime through
//! [`Element::exec_method`](crate::Element::exec_method).

use crate::error::{Error, Result};

/// Packs up to eight ASCII bytes into a big-endian tag.
///
/// ```rust
/// use gmf_core::cap::eight_cc;
/// assert_eq!(eight_cc(b"AEC"), 0x0000_0000_0041_4543);
/// ```
pub const fn eight_cc(tag: &[u8]) -> u64 {
    let mut out = 0u64;
    let mut i = 0;
    while i < tag.len() && i < 8 {
        out = (out << 8) | tag[i] as u64;
        i += 1;
    }
    out
}

/// A feature offered by an element.
#[derive(Debug, Clone, PartialEq)]
pub struct Capability {
    /// Packed tag, see [`eight_cc`].
    pub eight_cc: u64,
    /// Human-readable name.
    pub name: String,
    /// Named attributes describing the feature.
    pub attrs: Vec<(String, ArgValue)>,
}

impl Capability {
    /// Capability with no attributes; the tag is derived from `name`.
    pub fn new(name: &str) -> Self {
        Self {
            eight_cc: eight_cc(name.as_bytes()),
            name: name.to_owned(),
            attrs: Vec::new(),
        }
    }
}

/// Argument type of a method parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// Unsigned byte.
    U8,
    /// Unsigned 32-bit.
    U32,
    /// Signed 32-bit.
    I32,
    /// 32-bit float.
    F32,
    /// Boolean.
    Bool,
    /// UTF-8 text.
    Str,
}

/// A typed argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// Unsigned byte.
    U8(u8),
    /// Unsigned 32-bit.
    U32(u32),
    /// Signed 32-bit.
    I32(i32),
    /// 32-bit float.
    F32(f32),
    /// Boolean.
    Bool(bool),
    /// UTF-8 text.
    Str(String),
}

impl ArgValue {
    /// Type of this value.
    pub fn ty(&self) -> ArgType {
        match self {
            ArgValue::U8(_) => ArgType::U8,
            ArgValue::U32(_) => ArgType::U32,
            ArgValue::I32(_) => ArgType::I32,
            ArgValue::F32(_) => ArgType::F32,
            ArgValue::Bool(_) => ArgType::Bool,
            ArgValue::Str(_) => ArgType::Str,
        }
    }
}

/// Declared parameter of a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDesc {
    /// Parameter name.
    pub name: String,
    /// Parameter type.
    pub ty: ArgType,
}

/// A named element entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    /// Method name, matched case-insensitively.
    pub name: String,
    /// Declared parameters.
    pub args: Vec<ArgDesc>,
}

impl Method {
    /// Method with the given parameters.
    pub fn new(name: &str, args: &[(&str, ArgType)]) -> Self {
        Self {
            name: name.to_owned(),
            args: args
                .iter()
                .map(|&(n, ty)| ArgDesc {
                    name: n.to_owned(),
                    ty,
                })
                .collect(),
        }
    }

    /// Empty argument set shaped after this method's parameters.
    pub fn args(&self) -> MethodArgs {
        MethodArgs {
            desc: self.args.clone(),
            values: Vec::new(),
        }
    }
}

/// Argument values for one method call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodArgs {
    desc: Vec<ArgDesc>,
    values: Vec<(String, ArgValue)>,
}

impl MethodArgs {
    /// Sets a declared argument.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an undeclared name, [`Error::InvalidArg`] on
    /// a type mismatch.
    pub fn set(&mut self, name: &str, value: ArgValue) -> Result<()> {
        let desc = self
            .desc
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::not_found(format!("argument {name}")))?;
        if desc.ty != value.ty() {
            return Err(Error::invalid_arg(format!(
                "argument {name} expects {:?}, got {:?}",
                desc.ty,
                value.ty()
            )));
        }
        self.values.retain(|(n, _)| n != name);
        self.values.push((name.to_owned(), value));
        Ok(())
    }

    /// Value of `name`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] if the argument was not supplied.
    pub fn get(&self, name: &str) -> Result<&ArgValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| Error::invalid_arg(format!("missing argument {name}")))
    }

    /// Value of a `U8` argument.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] if missing or of another type.
    pub fn get_u8(&self, name: &str) -> Result<u8> {
        match self.get(name)? {
            ArgValue::U8(v) => Ok(*v),
            other => Err(Error::invalid_arg(format!("{name} is {:?}", other.ty()))),
        }
    }

    /// Value of an `F32` argument.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] if missing or of another type.
    pub fn get_f32(&self, name: &str) -> Result<f32> {
        match self.get(name)? {
            ArgValue::F32(v) => Ok(*v),
            other => Err(Error::invalid_arg(format!("{name} is {:?}", other.ty()))),
        }
    }

    /// Checks that every declared argument has a value.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArg`] naming the first missing argument.
    pub fn check_complete(&self) -> Result<()> {
        for d in &self.desc {
            self.get(&d.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eight_cc_truncates_to_eight_bytes() {
        assert_eq!(eight_cc(b""), 0);
        assert_eq!(eight_cc(b"ABCDEFGHIJ"), eight_cc(b"ABCDEFGH"));
    }

    #[test]
    fn args_are_typed() {
        let method = Method::new("vcmd_det", &[("enable", ArgType::U8)]);
        let mut args = method.args();
        assert!(matches!(args.check_complete(), Err(Error::InvalidArg(_))));
        assert!(matches!(
            args.set("enable", ArgValue::Bool(true)),
            Err(Error::InvalidArg(_))
        ));
        assert!(matches!(
            args.set("other", ArgValue::U8(1)),
            Err(Error::NotFound(_))
        ));
        args.set("enable", ArgValue::U8(1)).unwrap();
        assert_eq!(args.get_u8("enable").unwrap(), 1);
        assert!(args.check_complete().is_ok());
    }
}
