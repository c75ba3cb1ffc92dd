//! Terminal prompts for the operator

use std::io::{BufRead, Write};

use color_eyre::eyre::Context;
use color_eyre::Result;

/// Ask a yes/no question on `output` and read the answer from `input`.
/// Anything but `y`/`yes` (including end of input) is a no.
pub(crate) fn confirm_with(
    question: &str,
    mut input: impl BufRead,
    mut output: impl Write,
) -> Result<bool> {
    write!(output, "{question} [y/N] ")?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer).context("Reading answer")?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

/// [`confirm_with`] on the terminal. A read failure is a no.
pub(crate) fn confirm(question: &str) -> bool {
    confirm_with(question, std::io::stdin().lock(), std::io::stderr()).unwrap_or(false)
}

/// Print `message` and block until the operator presses Enter.
pub(crate) fn wait_for_enter(message: &str) -> Result<()> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{message} ")?;
    stderr.flush()?;
    std::io::stdin()
        .lock()
        .read_line(&mut String::new())
        .context("Waiting for Enter")?;
    Ok(())
}
