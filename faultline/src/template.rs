//! Finding the error page template for an exception.
//!
//! The search stops at the first existing file:
//!
//! 1. the explicit mapping for the exception type,
//! 2. the mapping for the nearest mapped ancestor,
//! 3. a file named after the exception type, e.g. `billing/card_declined.html`
//!    for `Billing::CardDeclined`,
//! 4. a file named after the status code, e.g. `404.html`,
//! 5. a file named after an ancestor, nearest first.
//!
//! Mappings only exist for HTML and JavaScript responses. Files are searched
//! for in the application template directory, the public directory and the
//! bundled template directory, in that order. A file matches when its name
//! starts with `<stem>.<format>`, so `404.html`, `404.html.erb` and
//! `404.html.tera` all match a 404 HTML lookup.

use std::fmt;
use std::path::{Path, PathBuf};

use derive_more::with_trait::Debug;
use faultline_core::StatusCode;
use faultline_core::config::FaultlineConfig;
use faultline_core::exception::{ExceptionType, file_stem};
use indexmap::IndexMap;
use tracing::{debug, error};

/// The format of the response being rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseFormat {
    /// HTML pages.
    Html,
    /// JavaScript responses.
    Js,
    /// XML documents.
    Xml,
    /// Anything else; matches templates with any extension.
    Other,
}

impl ResponseFormat {
    /// Derives the format from a request format or content type such as
    /// `"text/html"` or `"application/javascript"`.
    ///
    /// ```
    /// use faultline::template::ResponseFormat;
    ///
    /// assert_eq!(ResponseFormat::from_format("text/html"), ResponseFormat::Html);
    /// assert_eq!(ResponseFormat::from_format("text/javascript"), ResponseFormat::Js);
    /// assert_eq!(ResponseFormat::from_format("application/xml"), ResponseFormat::Xml);
    /// assert_eq!(ResponseFormat::from_format("application/pdf"), ResponseFormat::Other);
    /// ```
    #[must_use]
    pub fn from_format(format: &str) -> Self {
        let format = format.to_ascii_lowercase();
        if format.contains("html") {
            Self::Html
        } else if format.contains("js") || format.contains("javascript") {
            Self::Js
        } else if format.contains("xml") {
            Self::Xml
        } else {
            Self::Other
        }
    }

    /// The prefix a template extension must start with.
    #[must_use]
    pub fn extension_prefix(self) -> &'static str {
        match self {
            Self::Html => ".html",
            Self::Js => ".js",
            Self::Xml => ".xml",
            Self::Other => ".",
        }
    }

    fn mappings(self, config: &FaultlineConfig) -> Option<&IndexMap<String, PathBuf>> {
        match self {
            Self::Html => Some(&config.error_class_html_templates),
            Self::Js => Some(&config.error_class_js_templates),
            Self::Xml | Self::Other => None,
        }
    }
}

impl fmt::Display for ResponseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*", self.extension_prefix())
    }
}

/// Returns `true` if `file_name` is a template for `stem` with an extension
/// starting with `extension_prefix`.
///
/// ```
/// use faultline::template::matches_template;
///
/// assert!(matches_template("404.html", "404", ".html"));
/// assert!(matches_template("404.html.erb", "404", ".html"));
/// assert!(!matches_template("4040.html", "404", ".html"));
/// assert!(!matches_template("404.js", "404", ".html"));
/// assert!(matches_template("404.js", "404", "."));
/// ```
#[must_use]
pub fn matches_template(file_name: &str, stem: &str, extension_prefix: &str) -> bool {
    file_name
        .strip_prefix(stem)
        .is_some_and(|extension| extension.starts_with(extension_prefix))
}

/// Access to the files templates are looked up in.
pub trait TemplateFs: Send + Sync {
    /// Returns `true` if `path` is an existing file.
    fn is_file(&self, path: &Path) -> bool;

    /// Returns the first file in `dir` that matches `stem` and
    /// `extension_prefix` (see [`matches_template`]), ordered by file name.
    ///
    /// A `/` in `stem` descends into subdirectories of `dir`.
    fn find_matching(&self, dir: &Path, stem: &str, extension_prefix: &str) -> Option<PathBuf>;
}

/// [`TemplateFs`] backed by the local file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl TemplateFs for LocalFs {
    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn find_matching(&self, dir: &Path, stem: &str, extension_prefix: &str) -> Option<PathBuf> {
        let (subdir, basename) = match stem.rsplit_once('/') {
            Some((subdir, basename)) => (dir.join(subdir), basename),
            None => (dir.to_path_buf(), stem),
        };

        let entries = match std::fs::read_dir(&subdir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %subdir.display(), %err, "skipping template directory");
                return None;
            }
        };

        let mut matches: Vec<PathBuf> = entries
            .flatten()
            .filter(|entry| entry.file_type().is_ok_and(|file_type| file_type.is_file()))
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| matches_template(name, basename, extension_prefix))
            })
            .map(|entry| entry.path())
            .collect();
        matches.sort();
        matches.into_iter().next()
    }
}

/// Which step of the search produced a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateSource {
    /// The explicit mapping for the exception type.
    Mapping,
    /// The mapping for an ancestor of the exception type.
    AncestorMapping,
    /// A file named after the exception type.
    ExceptionName,
    /// A file named after the status code.
    StatusCode,
    /// A file named after an ancestor of the exception type.
    AncestorName,
    /// The configured default error template.
    DefaultTemplate,
    /// The template of last resort.
    LastResort,
}

/// A template found by [`TemplateResolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTemplate {
    /// The template file.
    pub path: PathBuf,
    /// How the template was found.
    pub source: TemplateSource,
}

impl ResolvedTemplate {
    fn new(path: PathBuf, source: TemplateSource) -> Self {
        Self { path, source }
    }
}

/// Looks up error templates according to a [`FaultlineConfig`].
///
/// # Examples
///
/// ```
/// use faultline::config::FaultlineConfig;
/// use faultline::exception::TypeHierarchy;
/// use faultline::template::{LocalFs, ResponseFormat, TemplateResolver, TemplateSource};
/// use faultline::StatusCode;
///
/// let dir = tempfile::tempdir()?;
/// std::fs::write(dir.path().join("404.html"), "not found")?;
///
/// let config = FaultlineConfig::builder().error_template_dir(dir.path()).build();
/// let resolver = TemplateResolver::new(&config, &LocalFs);
/// let hierarchy = TypeHierarchy::with_defaults();
///
/// let template = resolver
///     .resolve(&hierarchy.lookup("RoutingError"), StatusCode::NOT_FOUND, ResponseFormat::Html)
///     .unwrap();
/// assert_eq!(template.path, dir.path().join("404.html"));
/// assert_eq!(template.source, TemplateSource::StatusCode);
/// # Ok::<(), std::io::Error>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TemplateResolver<'a> {
    config: &'a FaultlineConfig,
    #[debug("..")]
    fs: &'a dyn TemplateFs,
}

impl<'a> TemplateResolver<'a> {
    /// Creates a resolver reading files through `fs`.
    #[must_use]
    pub fn new(config: &'a FaultlineConfig, fs: &'a dyn TemplateFs) -> Self {
        Self { config, fs }
    }

    /// Finds the template for an exception of type `exception_type`
    /// classified as `status_code`.
    ///
    /// Returns `None` when no step of the search finds a file.
    #[must_use]
    pub fn resolve(
        &self,
        exception_type: &ExceptionType,
        status_code: StatusCode,
        format: ResponseFormat,
    ) -> Option<ResolvedTemplate> {
        if let Some(mappings) = format.mappings(self.config)
            && let Some(template) = self.resolve_mapping(exception_type, mappings)
        {
            return Some(template);
        }

        let extension = format.extension_prefix();
        self.find_in_search_dirs(&exception_type.file_stem(), extension)
            .map(|path| ResolvedTemplate::new(path, TemplateSource::ExceptionName))
            .or_else(|| {
                self.find_in_search_dirs(status_code.as_str(), extension)
                    .map(|path| ResolvedTemplate::new(path, TemplateSource::StatusCode))
            })
            .or_else(|| {
                exception_type.ancestors().iter().find_map(|ancestor| {
                    self.find_in_search_dirs(&file_stem(ancestor), extension)
                        .map(|path| ResolvedTemplate::new(path, TemplateSource::AncestorName))
                })
            })
    }

    /// Like [`resolve`](Self::resolve), falling back to the configured
    /// default error template and then to the template of last resort.
    ///
    /// Returns `None` only if the last resort does not exist either.
    #[must_use]
    pub fn resolve_or_fallback(
        &self,
        exception_type: &ExceptionType,
        status_code: StatusCode,
        format: ResponseFormat,
    ) -> Option<ResolvedTemplate> {
        if let Some(template) = self.resolve(exception_type, status_code, format) {
            debug!(path = %template.path.display(), "will render error template");
            return Some(template);
        }

        error!(
            exception_type = exception_type.name(),
            status_code = status_code.as_u16(),
            default_template = ?self.config.default_error_template,
            "could not find an error template in the usual places, trying the default error template"
        );
        if let Some(path) = &self.config.default_error_template
            && self.fs.is_file(path)
        {
            return Some(ResolvedTemplate::new(
                path.clone(),
                TemplateSource::DefaultTemplate,
            ));
        }

        let last_resort = self.config.last_resort_template();
        error!(
            last_resort = ?last_resort,
            "still no error template found, using the template of last resort"
        );
        match last_resort {
            Some(path) if self.fs.is_file(&path) => {
                Some(ResolvedTemplate::new(path, TemplateSource::LastResort))
            }
            _ => {
                error!("the template of last resort does not exist");
                None
            }
        }
    }

    fn resolve_mapping(
        &self,
        exception_type: &ExceptionType,
        mappings: &IndexMap<String, PathBuf>,
    ) -> Option<ResolvedTemplate> {
        if let Some(path) = mappings.get(exception_type.name()) {
            if self.fs.is_file(path) {
                return Some(ResolvedTemplate::new(path.clone(), TemplateSource::Mapping));
            }
            error!(
                exception_type = exception_type.name(),
                path = %path.display(),
                "found a template mapping for the exception type, but the file was not found"
            );
        }

        let (ancestor, path) = exception_type
            .ancestors()
            .iter()
            .find_map(|ancestor| mappings.get(ancestor).map(|path| (ancestor, path)))?;
        if self.fs.is_file(path) {
            return Some(ResolvedTemplate::new(
                path.clone(),
                TemplateSource::AncestorMapping,
            ));
        }
        error!(
            ancestor = ancestor.as_str(),
            path = %path.display(),
            "found a template mapping for an ancestor type, but the file was not found"
        );
        None
    }

    fn find_in_search_dirs(&self, stem: &str, extension_prefix: &str) -> Option<PathBuf> {
        self.config
            .template_search_dirs()
            .find_map(|dir| self.fs.find_matching(dir, stem, extension_prefix))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use faultline_core::exception::TypeHierarchy;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    use super::*;

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, name).unwrap();
        path
    }

    fn hierarchy() -> TypeHierarchy {
        let mut hierarchy = TypeHierarchy::with_defaults();
        hierarchy
            .register("Billing::CardDeclined", Some("RuntimeError"))
            .unwrap();
        hierarchy
    }

    #[test]
    fn response_format_display() {
        assert_eq!(ResponseFormat::Html.to_string(), ".html*");
        assert_eq!(ResponseFormat::Other.to_string(), ".*");
    }

    #[test]
    fn local_fs_orders_matches_by_name() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "500.html.tera");
        touch(&dir, "500.html");
        touch(&dir, "500.js");

        let found = LocalFs.find_matching(dir.path(), "500", ".html");

        assert_eq!(found, Some(dir.path().join("500.html")));
    }

    #[test]
    fn local_fs_descends_into_namespaces() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "billing/card_declined.html");

        let found = LocalFs.find_matching(dir.path(), "billing/card_declined", ".html");

        assert_eq!(found, Some(path));
    }

    #[test]
    fn local_fs_missing_dir() {
        let dir = TempDir::new().unwrap();

        assert_eq!(
            LocalFs.find_matching(&dir.path().join("nope"), "500", "."),
            None
        );
    }

    #[test]
    fn direct_mapping_wins() {
        let dir = TempDir::new().unwrap();
        let mapped = touch(&dir, "mapped/declined.html");
        touch(&dir, "templates/billing/card_declined.html");
        let config = FaultlineConfig::builder()
            .error_template_dir(dir.path().join("templates"))
            .map_html_template("Billing::CardDeclined", &mapped)
            .build();

        let template = TemplateResolver::new(&config, &LocalFs)
            .resolve(
                &hierarchy().lookup("Billing::CardDeclined"),
                StatusCode::INTERNAL_SERVER_ERROR,
                ResponseFormat::Html,
            )
            .unwrap();

        assert_eq!(template, ResolvedTemplate::new(mapped, TemplateSource::Mapping));
    }

    #[test]
    fn ancestor_mapping() {
        let dir = TempDir::new().unwrap();
        let runtime = touch(&dir, "runtime.html");
        let standard = touch(&dir, "standard.html");
        let config = FaultlineConfig::builder()
            .map_html_template("StandardError", standard)
            .map_html_template("RuntimeError", &runtime)
            .build();

        let template = TemplateResolver::new(&config, &LocalFs)
            .resolve(
                &hierarchy().lookup("Billing::CardDeclined"),
                StatusCode::INTERNAL_SERVER_ERROR,
                ResponseFormat::Html,
            )
            .unwrap();

        assert_eq!(
            template,
            ResolvedTemplate::new(runtime, TemplateSource::AncestorMapping)
        );
    }

    #[test]
    fn js_format_ignores_html_mappings() {
        let dir = TempDir::new().unwrap();
        let html = touch(&dir, "declined.html");
        let js = touch(&dir, "templates/500.js");
        let config = FaultlineConfig::builder()
            .error_template_dir(dir.path().join("templates"))
            .map_html_template("Billing::CardDeclined", html)
            .build();

        let template = TemplateResolver::new(&config, &LocalFs)
            .resolve(
                &hierarchy().lookup("Billing::CardDeclined"),
                StatusCode::INTERNAL_SERVER_ERROR,
                ResponseFormat::Js,
            )
            .unwrap();

        assert_eq!(template, ResolvedTemplate::new(js, TemplateSource::StatusCode));
    }

    #[test]
    fn exception_name_beats_status_code_in_earlier_dir() {
        let app = TempDir::new().unwrap();
        let public = TempDir::new().unwrap();
        touch(&app, "500.html");
        let by_name = touch(&public, "billing/card_declined.html");
        let config = FaultlineConfig::builder()
            .error_template_dir(app.path())
            .public_dir(public.path())
            .build();

        let template = TemplateResolver::new(&config, &LocalFs)
            .resolve(
                &hierarchy().lookup("Billing::CardDeclined"),
                StatusCode::INTERNAL_SERVER_ERROR,
                ResponseFormat::Html,
            )
            .unwrap();

        assert_eq!(
            template,
            ResolvedTemplate::new(by_name, TemplateSource::ExceptionName)
        );
    }

    #[test]
    fn ancestor_name_nearest_first() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "exception.html");
        let standard = touch(&dir, "standard_error.html");
        let config = FaultlineConfig::builder().bundled_template_dir(dir.path()).build();

        let template = TemplateResolver::new(&config, &LocalFs)
            .resolve(
                &hierarchy().lookup("Billing::CardDeclined"),
                StatusCode::INTERNAL_SERVER_ERROR,
                ResponseFormat::Html,
            )
            .unwrap();

        assert_eq!(
            template,
            ResolvedTemplate::new(standard, TemplateSource::AncestorName)
        );
    }

    #[test]
    #[traced_test]
    fn fallback_chain() {
        let dir = TempDir::new().unwrap();
        let last_resort = touch(&dir, "bundled/500.html");
        let config = FaultlineConfig::builder()
            .bundled_template_dir(dir.path().join("bundled"))
            .default_error_template(dir.path().join("missing.html"))
            .build();
        let resolver = TemplateResolver::new(&config, &LocalFs);
        let exception_type = hierarchy().lookup("Billing::CardDeclined");

        assert_eq!(
            resolver.resolve(&exception_type, StatusCode::NOT_FOUND, ResponseFormat::Js),
            None
        );
        assert_eq!(
            resolver.resolve_or_fallback(&exception_type, StatusCode::NOT_FOUND, ResponseFormat::Js),
            Some(ResolvedTemplate::new(last_resort, TemplateSource::LastResort))
        );
        assert!(logs_contain("could not find an error template"));
        assert!(logs_contain("template of last resort"));
    }

    #[test]
    fn fallback_to_default_template() {
        let dir = TempDir::new().unwrap();
        let default = touch(&dir, "default.html");
        let config = FaultlineConfig::builder()
            .default_error_template(&default)
            .build();

        let template = TemplateResolver::new(&config, &LocalFs).resolve_or_fallback(
            &hierarchy().lookup("RuntimeError"),
            StatusCode::INTERNAL_SERVER_ERROR,
            ResponseFormat::Html,
        );

        assert_eq!(
            template,
            Some(ResolvedTemplate::new(default, TemplateSource::DefaultTemplate))
        );
    }

    #[test]
    fn nothing_at_all() {
        let config = FaultlineConfig::default();

        let template = TemplateResolver::new(&config, &LocalFs).resolve_or_fallback(
            &hierarchy().lookup("RuntimeError"),
            StatusCode::INTERNAL_SERVER_ERROR,
            ResponseFormat::Html,
        );

        assert_eq!(template, None);
    }
}
