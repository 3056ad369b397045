/// Extension trait for commands spawned by the installer.
pub trait PistonCommandExt {
    /// Hides the console window on Windows. No-op on other platforms.
    fn suppress_console(&mut self) -> &mut Self;
}

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

impl PistonCommandExt for tokio::process::Command {
    fn suppress_console(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            self.creation_flags(CREATE_NO_WINDOW);
        }
        self
    }
}

/// Separator used when joining a Java classpath on this platform.
pub fn classpath_separator() -> &'static str {
    if cfg!(windows) {
        ";"
    } else {
        ":"
    }
}
