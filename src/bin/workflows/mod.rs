mod commands;
mod context;

pub(crate) use commands::{
    build_all, build_bundles, build_delta_packs, build_image, build_update, format_bump,
    format_bump_new, format_bump_old, upstream_format,
};
pub(crate) use context::BuildContext;
