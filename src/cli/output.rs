use std::io;
use std::path::{Path, PathBuf};

/// Output location of one CLI invocation: every artifact shares the
/// parameter file's base name and lands in the same directory, e.g.
/// `out/solve/double_integrator[/20260806_120000]/double_integrator_*.json`.
pub struct FilePrefix {
    pub directory_path: PathBuf,
    pub file_base: String,
}

impl FilePrefix {
    /// Builds (and creates) the output directory for a subcommand run,
    /// optionally nested in a date-time stamped folder.
    pub fn for_params(
        params_path: &str,
        subcommand: &str,
        date_time_out: bool,
    ) -> io::Result<FilePrefix> {
        let file_base = Path::new(params_path)
            .file_stem()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot derive a base name from {:?}", params_path),
                )
            })?
            .to_owned();

        let mut directory_path: PathBuf = ["out", subcommand, &file_base].iter().collect();
        if date_time_out {
            directory_path.push(date_time_string());
        }
        std::fs::create_dir_all(&directory_path)?;

        Ok(FilePrefix {
            directory_path,
            file_base,
        })
    }

    pub fn with_suffix(&self, suffix: &str) -> PathBuf {
        self.directory_path.join(self.file_base.clone() + suffix)
    }

    pub fn create_file_with_suffix(
        &self,
        suffix: &str,
    ) -> io::Result<io::BufWriter<std::fs::File>> {
        let path = self.with_suffix(suffix);
        Ok(io::BufWriter::new(std::fs::File::create(path)?))
    }
}

fn date_time_string() -> String {
    use chrono::{Datelike, Local, Timelike};
    let local_time = Local::now();
    format!(
        "{:04}{:02}{:02}_{:02}{:02}{:02}",
        local_time.year(),
        local_time.month(),
        local_time.day(),
        local_time.hour(),
        local_time.minute(),
        local_time.second()
    )
}
