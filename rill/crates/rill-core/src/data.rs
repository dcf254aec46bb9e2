//! Host data objects.
//!
//! A data object is a host-owned opaque byte buffer plus an array of
//! member values, typed by a registered [`DataInfo`] descriptor.
//! Native closures can carry a data object; the callback receives
//! its members and buffer.  The descriptor's destructor runs over
//! the buffer when the object is collected.

use std::rc::Rc;

use rill_util::Symbol;

use crate::value::Value;

/// A registered data descriptor.
pub struct DataInfo {
    /// Printable type tag.
    pub type_sym: Symbol,
    /// Buffer size in bytes.
    pub size: usize,
    /// Number of member value slots.
    pub n_mems: usize,
    /// Runs over the buffer when an instance is collected.
    pub destr: Option<Rc<dyn Fn(&mut [u8])>>,
}

/// The payload of a data object.
pub struct DataBox {
    pub info: Rc<DataInfo>,
    pub bytes: Box<[u8]>,
    pub mems: Vec<Value>,
}

impl DataBox {
    pub fn new(info: Rc<DataInfo>) -> Self {
        let bytes = vec![0u8; info.size].into_boxed_slice();
        let mems = vec![Value::Udf; info.n_mems];
        Self { info, bytes, mems }
    }
}
