//! Where a detector's FITS file lands on disk. Kept as a narrow injected
//! port, the same shape as `archon_core::ports`, so the orchestrator's
//! tests can run against an in-memory policy without touching a real
//! storage path template.

use std::path::PathBuf;

/// Computes the destination path for one controller/detector's FITS file
/// within a given exposure.
pub trait FilenamePolicy: Send + Sync {
    /// Returns the full path the frame for `(exposure_no, controller,
    /// detector)` should be written to.
    fn path_for(&self, exposure_no: u64, controller: &str, detector: &str) -> String;
}

/// A policy that substitutes `{observatory}`, `{hemisphere}`, `{controller}`,
/// `{detector}`, and `{exposure}` (zero-padded to five digits) into a
/// filename template, joined under a root directory. `{observatory}` and
/// `{hemisphere}` are the site-identity placeholders named in `spec.md` §6;
/// `{detector}` is added because this daemon persists one file per detector
/// region rather than per controller (`spec.md` §6's "or per detector,
/// depending on buffer layout").
#[derive(Debug, Clone)]
pub struct TemplateFilenamePolicy {
    /// Root directory files are written under.
    pub directory: PathBuf,
    /// Filename template, e.g. `"{observatory}_{controller}_{detector}_{exposure}.fits"`.
    pub template: String,
    /// Site identity substituted for `{observatory}`.
    pub observatory: String,
    /// Site identity substituted for `{hemisphere}`, e.g. `"north"`/`"south"`.
    pub hemisphere: String,
}

impl TemplateFilenamePolicy {
    /// Creates a policy writing under `directory` using `template`, with
    /// empty `{observatory}`/`{hemisphere}` substitutions.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self { directory: directory.into(), template: template.into(), observatory: String::new(), hemisphere: String::new() }
    }

    /// Sets the `{observatory}`/`{hemisphere}` substitutions, builder-style.
    #[must_use]
    pub fn with_site(mut self, observatory: impl Into<String>, hemisphere: impl Into<String>) -> Self {
        self.observatory = observatory.into();
        self.hemisphere = hemisphere.into();
        self
    }
}

impl FilenamePolicy for TemplateFilenamePolicy {
    fn path_for(&self, exposure_no: u64, controller: &str, detector: &str) -> String {
        let file_name = self
            .template
            .replace("{observatory}", &self.observatory)
            .replace("{hemisphere}", &self.hemisphere)
            .replace("{controller}", controller)
            .replace("{detector}", detector)
            .replace("{exposure}", &format!("{exposure_no:05}"));
        self.directory.join(file_name).to_string_lossy().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitutes_all_placeholders_and_zero_pads_the_exposure_number() {
        let policy = TemplateFilenamePolicy::new("/data", "{controller}_{detector}_{exposure}.fits");
        let path = policy.path_for(7, "ccd1", "red");
        assert_eq!(path, "/data/ccd1_red_00007.fits");
    }

    #[test]
    fn template_substitutes_observatory_and_hemisphere() {
        let policy = TemplateFilenamePolicy::new("/data", "{observatory}_{hemisphere}_{controller}_{exposure}.fits")
            .with_site("keck", "north");
        let path = policy.path_for(3, "ccd1", "red");
        assert_eq!(path, "/data/keck_north_ccd1_00003.fits");
    }
}
