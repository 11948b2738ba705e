// System-level collaborators

/// Device restart, used by the `reboot` command.
pub trait SystemControl: Send {
    /// Does not return on hardware.
    fn restart(&mut self);
}
