/// Logical drive level decided by the control cycle. The physical line is
/// active-low; `RelayDriver` implementations own that inversion so `On`
/// always means "element energized".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDrive {
    On,
    Off,
}

impl RelayDrive {
    pub fn energized(self) -> bool {
        matches!(self, Self::On)
    }
}

pub trait RelayDriver {
    fn set_energized(&mut self, energized: bool);

    fn apply(&mut self, drive: RelayDrive) {
        self.set_energized(drive.energized());
    }
}
