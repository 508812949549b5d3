pub mod decode_utils;
pub mod markup_utils;
pub mod placeholder_utils;
