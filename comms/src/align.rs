// Primitive number types whose alignment divides 8, so a buffer of them can back
// an 8 byte aligned frame.
pub trait Align8: bytemuck::Pod {}

impl Align8 for u64 {}
impl Align8 for i64 {}
impl Align8 for f64 {}
