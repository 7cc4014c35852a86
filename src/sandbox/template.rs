//! Starter projects seeded into freshly created local sandboxes.
//!
//! Template files are compiled into the binary so a sandbox can be
//! scaffolded without any files on disk next to the executable.

use tracing::warn;

mod vite_react {
    pub const PACKAGE_JSON: &str = include_str!("../../templates/vite-react/package.json");
    pub const VITE_CONFIG: &str = include_str!("../../templates/vite-react/vite.config.js");
    pub const TAILWIND_CONFIG: &str =
        include_str!("../../templates/vite-react/tailwind.config.js");
    pub const POSTCSS_CONFIG: &str = include_str!("../../templates/vite-react/postcss.config.js");
    pub const INDEX_HTML: &str = include_str!("../../templates/vite-react/index.html");
    pub const MAIN_JSX: &str = include_str!("../../templates/vite-react/src/main.jsx");
    pub const APP_JSX: &str = include_str!("../../templates/vite-react/src/App.jsx");
    pub const INDEX_CSS: &str = include_str!("../../templates/vite-react/src/index.css");
}

/// Placeholder in template files replaced by the dev server port.
const PORT_PLACEHOLDER: &str = "{{port}}";

/// Files for `template`, with the dev server bound to `port`.
///
/// Returns `None` for a template this build does not ship.
pub fn scaffold(template: &str, port: u16) -> Option<Vec<(&'static str, String)>> {
    let files: &[(&'static str, &'static str)] = match template {
        "vite-react" => &[
            ("package.json", vite_react::PACKAGE_JSON),
            ("vite.config.js", vite_react::VITE_CONFIG),
            ("tailwind.config.js", vite_react::TAILWIND_CONFIG),
            ("postcss.config.js", vite_react::POSTCSS_CONFIG),
            ("index.html", vite_react::INDEX_HTML),
            ("src/main.jsx", vite_react::MAIN_JSX),
            ("src/App.jsx", vite_react::APP_JSX),
            ("src/index.css", vite_react::INDEX_CSS),
        ],
        other => {
            warn!(template = other, "unknown sandbox template, starting empty");
            return None;
        }
    };
    let port = port.to_string();
    Some(
        files
            .iter()
            .map(|(path, body)| (*path, body.replace(PORT_PLACEHOLDER, &port)))
            .collect(),
    )
}
