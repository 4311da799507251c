//! Pages bundled into the binary and copied onto the filesystem when missing.

use irblaster_common::{
    hal::{Filesystem, HalResult},
    template::SETUP_TEMPLATE,
    web::INDEX_PAGE,
};

const INDEX_HTML: &str = include_str!("../data/index.html");
const SETUP_TEMPLATE_HTML: &str = include_str!("../data/setup.template.html");

/// Returns how many files were written.
pub fn seed(fs: &impl Filesystem) -> HalResult<usize> {
    let mut seeded = 0;
    for (path, body) in [(INDEX_PAGE, INDEX_HTML), (SETUP_TEMPLATE, SETUP_TEMPLATE_HTML)] {
        if !fs.exists(path) {
            fs.write(path, body.as_bytes())?;
            seeded += 1;
        }
    }
    Ok(seeded)
}
