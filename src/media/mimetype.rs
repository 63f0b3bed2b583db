use image::ImageFormat;
use infer::MatcherType;

fn sniff_image(bytes: &[u8]) -> Option<infer::Type> {
    infer::get(bytes).filter(|kind| kind.matcher_type() == MatcherType::Image)
}

/// Detects the image format from the content, ignoring any file name.
pub fn detect_image_format(bytes: &[u8]) -> Option<ImageFormat> {
    sniff_image(bytes).and_then(|kind| ImageFormat::from_mime_type(kind.mime_type()))
}

pub fn detect_extension(bytes: &[u8]) -> Option<&'static str> {
    sniff_image(bytes).map(|kind| kind.extension())
}
