mod lz_decoder;

pub(crate) use lz_decoder::*;
