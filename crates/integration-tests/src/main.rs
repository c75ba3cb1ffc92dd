use std::path::Path;

use camino::Utf8PathBuf;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};

mod tests {
    pub mod cli;
    pub mod preflight;
}

/// Get the path to the qinstall binary from QINSTALL_PATH.
///
/// The tests run the binary from throwaway directories, so a relative path
/// is resolved against the current directory first.
pub(crate) fn get_qinstall_command() -> Result<Utf8PathBuf> {
    if let Ok(path) = std::env::var("QINSTALL_PATH") {
        let path = std::fs::canonicalize(&path)
            .with_context(|| format!("Resolving QINSTALL_PATH={path}"))?;
        return Utf8PathBuf::from_path_buf(path)
            .map_err(|p| eyre!("QINSTALL_PATH is not UTF-8: {}", p.display()));
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/qinstall", "target/release/qinstall"]
        .into_iter()
        .find(|p| Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set QINSTALL_PATH={path} to run using this binary"
        ));
    }
    Err(eyre!("QINSTALL_PATH must point at a built qinstall binary"))
}

fn main() {
    let args = Arguments::from_args();

    let tests = vec![
        Trial::test("help_lists_headless", || {
            tests::cli::test_help_lists_headless();
            Ok(())
        }),
        Trial::test("unknown_flag_rejected", || {
            tests::cli::test_unknown_flag_rejected();
            Ok(())
        }),
        Trial::test("existing_output_dir", || {
            tests::preflight::test_existing_output_dir();
            Ok(())
        }),
        Trial::test("existing_output_file", || {
            tests::preflight::test_existing_output_file();
            Ok(())
        }),
        Trial::test("missing_dependencies", || {
            tests::preflight::test_missing_dependencies();
            Ok(())
        }),
        Trial::test("missing_ssh_key", || {
            tests::preflight::test_missing_ssh_key();
            Ok(())
        }),
    ];

    libtest_mimic::run(&args, tests).exit();
}
