use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const ARCHIVE_NAME: &str = "vision-studio-project.zip";

/// Project sources, captured at build time.
pub const PROJECT_FILES: &[(&str, &str)] = &[
    ("Cargo.toml", include_str!("../Cargo.toml")),
    ("migrations/20250101000000_kv.sql", include_str!("../migrations/20250101000000_kv.sql")),
    ("src/main.rs", include_str!("main.rs")),
    ("src/attachment.rs", include_str!("attachment.rs")),
    ("src/conversation.rs", include_str!("conversation.rs")),
    ("src/export.rs", include_str!("export.rs")),
    ("src/models.rs", include_str!("models.rs")),
    ("src/preferences.rs", include_str!("preferences.rs")),
    ("src/prompt.rs", include_str!("prompt.rs")),
    ("src/server.rs", include_str!("server.rs")),
    ("src/session.rs", include_str!("session.rs")),
    ("src/settings.rs", include_str!("settings.rs")),
    ("src/storage.rs", include_str!("storage.rs")),
    ("src/store.rs", include_str!("store.rs")),
    ("src/studio.rs", include_str!("studio.rs")),
];

const README: &str = "# Vision Studio\n\n\
This archive contains the source code of the Vision Studio service. Build it with \
`cargo build --release` and start it with `vision_studio serve`.\n";

/// Bundles the project sources plus a README into a zip archive.
pub fn project_archive() -> anyhow::Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (path, content) in PROJECT_FILES {
        zip.start_file(*path, options)?;
        zip.write_all(content.as_bytes())?;
    }
    zip.start_file("README.md", options)?;
    zip.write_all(README.as_bytes())?;
    Ok(zip.finish()?.into_inner())
}
