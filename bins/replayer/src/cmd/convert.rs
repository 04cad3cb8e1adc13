use clap::Parser;
use convert::{find_fixture_files, ConvertError, ConvertOptions, Converter};
use indicatif::{ProgressBar, ProgressDrawTarget};
use payload::{PayloadError, PayloadFile};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

/// `convert` subcommand
#[derive(Parser, Debug)]
pub struct Cmd {
    /// Directory with EEST blockchain test fixtures
    ///
    /// Searched recursively for files with the extension `.json`.
    path: PathBuf,
    /// Payload file to write
    #[arg(short = 'o', long, default_value = "payloads.yaml")]
    output: PathBuf,
    /// Regex selecting tests by payload name
    #[arg(long)]
    pattern: Option<String>,
    /// Regex excluding tests by payload name
    #[arg(long)]
    exclude: Option<String>,
}

/// Errors of the `convert` subcommand.
#[derive(Debug, Error)]
pub enum Error {
    /// Fixture directory does not exist.
    #[error("path {0} not found")]
    PathNotFound(PathBuf),
    /// Filters are invalid.
    #[error(transparent)]
    Convert(#[from] ConvertError),
    /// Output could not be written.
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl Cmd {
    /// Runs the `convert` command.
    pub fn run(&self) -> Result<(), Error> {
        if !self.path.exists() {
            return Err(Error::PathNotFound(self.path.clone()));
        }
        let converter = Converter::new(ConvertOptions {
            include: self.pattern.clone(),
            exclude: self.exclude.clone(),
            verbose: false,
        })?;

        let files = find_fixture_files(&self.path);
        let console_bar =
            ProgressBar::with_draw_target(Some(files.len() as u64), ProgressDrawTarget::stdout());
        let mut document = PayloadFile::default();
        let mut failed = 0usize;
        for file in &files {
            match converter.convert_file(&self.path, file) {
                Ok(payloads) => document.payloads.extend(payloads),
                Err(error) => {
                    console_bar.suspend(|| warn!(file = %file.display(), %error, "skipping fixture"));
                    failed += 1;
                }
            }
            console_bar.inc(1);
        }
        console_bar.finish();

        document.write(&self.output)?;
        info!(
            files = files.len(),
            failed,
            payloads = document.payloads.len(),
            output = %self.output.display(),
            "wrote payload file"
        );
        Ok(())
    }
}
