use duct::cmd;
use snafu::{ensure, ResultExt};
use std::path::PathBuf;

use crate::{error, Result};

/// A thin synchronous wrapper around an external image-tool binary (`crane`,
/// `gcrane`, `krane`, or `docker`). Every call blocks the calling thread,
/// which is fine here since callers already run inside a worker thread.
pub(crate) struct CommandLine {
    pub(crate) path: PathBuf,
}

impl CommandLine {
    /// Run the tool and capture stdout. Fails if the process exits non-zero.
    pub(crate) fn output(&self, args: &[&str], error_msg: String) -> Result<Vec<u8>> {
        let output = cmd(&self.path, args)
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .context(error::CommandFailedSnafu {
                message: error_msg.clone(),
            })?;
        ensure!(
            output.status.success(),
            error::OperationFailedSnafu {
                message: String::from_utf8_lossy(&output.stderr).to_string(),
                program: self.path.clone(),
                args: args.iter().map(|x| x.to_string()).collect::<Vec<_>>(),
            }
        );
        Ok(output.stdout)
    }

    /// Run the tool, streaming its stdout/stderr to ours. Used for operations
    /// like `pull` and `push` where the caller wants to see progress.
    pub(crate) fn spawn(&self, args: &[&str], error_msg: String) -> Result<()> {
        let output = cmd(&self.path, args)
            .stderr_capture()
            .unchecked()
            .run()
            .context(error::CommandFailedSnafu {
                message: error_msg.clone(),
            })?;
        ensure!(
            output.status.success(),
            error::OperationFailedSnafu {
                message: String::from_utf8_lossy(&output.stderr).to_string(),
                program: self.path.clone(),
                args: args.iter().map(|x| x.to_string()).collect::<Vec<_>>(),
            }
        );
        Ok(())
    }
}
