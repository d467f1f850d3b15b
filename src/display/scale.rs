/// Per-axis scale that fits a `src_w`x`src_h` picture into a `view_w`x`view_h`
/// viewport without distortion. The overflowing axis is shrunk, the other stays 1.0.
pub fn aspect_scale(view_w: u32, view_h: u32, src_w: u32, src_h: u32) -> (f32, f32) {
    if view_w == 0 || view_h == 0 || src_w == 0 || src_h == 0 {
        return (1.0, 1.0);
    }
    let view_aspect = view_w as f32 / view_h as f32;
    let src_aspect = src_w as f32 / src_h as f32;
    if view_aspect > src_aspect {
        (src_aspect / view_aspect, 1.0)
    } else {
        (1.0, view_aspect / src_aspect)
    }
}
