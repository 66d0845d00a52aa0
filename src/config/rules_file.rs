//! Loads one or more `--rules-file` paths into a flat rule list, reporting
//! parse errors as `<path>:<lineno> <message>`.

use std::path::Path;

use crate::segmentation::SegmentationRule;
use crate::segmentation::rules::parse_rules_file;

#[derive(Debug)]
pub struct RulesFileError(pub String);

impl std::fmt::Display for RulesFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RulesFileError {}

pub fn load_rules_file(path: &Path) -> Result<Vec<SegmentationRule>, RulesFileError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RulesFileError(format!("{}: {e}", path.display())))?;

    parse_rules_file(&text).map_err(|e| match e.line {
        Some(line) => RulesFileError(format!("{}:{line} {}", path.display(), e.message)),
        None => RulesFileError(format!("{}: {}", path.display(), e.message)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_valid_rules_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment\nexample.com=direct\n").unwrap();
        let rules = load_rules_file(file.path()).unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn reports_path_and_line_number_on_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "example.com=direct\nbad-line\n").unwrap();
        let err = load_rules_file(file.path()).unwrap_err();
        assert!(err.0.contains(":2 "));
    }

    #[test]
    fn missing_file_reports_io_error() {
        let err = load_rules_file(Path::new("/nonexistent/rules.txt")).unwrap_err();
        assert!(err.0.contains("/nonexistent/rules.txt"));
    }
}
