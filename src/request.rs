use std::fmt;
use std::os::raw::c_void;
use std::ptr;

/// One in-flight tile access.
///
/// Created by the caller immediately before access; `buffer` and `context`
/// are populated by the start callback and cleared again by the end
/// callback. A request must not outlive one start/end pair.
#[repr(C)]
pub struct TileRequest {
    /// Tile-grid x coordinate.
    pub tx: i32,
    /// Tile-grid y coordinate.
    pub ty: i32,
    /// Read-only accesses promise not to write through `buffer`.
    pub readonly: bool,
    /// Raw pixel view into the host's tile storage, null until started.
    pub buffer: *mut u16,
    /// Retained buffer object carried between start and end.
    pub context: *mut c_void,
}

impl TileRequest {
    pub fn new(tx: i32, ty: i32, readonly: bool) -> Self {
        Self {
            tx,
            ty,
            readonly,
            buffer: ptr::null_mut(),
            context: ptr::null_mut(),
        }
    }

    /// True once a start callback has attached a pixel buffer.
    pub fn has_buffer(&self) -> bool {
        !self.buffer.is_null()
    }
}

impl fmt::Debug for TileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TileRequest {{ tx: {}, ty: {}, readonly: {}, buffer: {:?} }}",
            self.tx, self.ty, self.readonly, self.buffer
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_requests_start_without_buffer_or_context() {
        let request = TileRequest::new(7, -2, true);
        assert_eq!(request.tx, 7);
        assert_eq!(request.ty, -2);
        assert!(request.readonly);
        assert!(!request.has_buffer());
        assert!(request.context.is_null());
    }
}
