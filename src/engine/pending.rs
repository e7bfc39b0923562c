use std::sync::atomic::{AtomicUsize, Ordering};

/// Commands that expose an in-flight flag to views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineCommand {
    Run,
    DryRun,
    Pause,
    Resume,
    Cancel,
    Reorder,
    RemoveItem,
    SetParallelism,
    SetOnCompletion,
    SavePreset,
    DeletePreset,
    LoadPreset,
}

impl EngineCommand {
    pub const ALL: [EngineCommand; 12] = [
        Self::Run,
        Self::DryRun,
        Self::Pause,
        Self::Resume,
        Self::Cancel,
        Self::Reorder,
        Self::RemoveItem,
        Self::SetParallelism,
        Self::SetOnCompletion,
        Self::SavePreset,
        Self::DeletePreset,
        Self::LoadPreset,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Counts of in-flight calls per command.
#[derive(Debug, Default)]
pub struct PendingFlags {
    counts: [AtomicUsize; EngineCommand::ALL.len()],
}

impl PendingFlags {
    /// Marks `command` in flight until the guard drops.
    pub fn begin(&self, command: EngineCommand) -> PendingGuard<'_> {
        self.counts[command.index()].fetch_add(1, Ordering::SeqCst);
        PendingGuard {
            flags: self,
            command,
        }
    }

    pub fn is_pending(&self, command: EngineCommand) -> bool {
        self.counts[command.index()].load(Ordering::SeqCst) > 0
    }

    pub fn snapshot(&self) -> PendingSnapshot {
        PendingSnapshot {
            commands: EngineCommand::ALL
                .into_iter()
                .filter(|c| self.is_pending(*c))
                .collect(),
        }
    }
}

/// Commands in flight at the time of the read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PendingSnapshot {
    pub commands: Vec<EngineCommand>,
}

impl PendingSnapshot {
    pub fn contains(&self, command: EngineCommand) -> bool {
        self.commands.contains(&command)
    }

    pub fn is_idle(&self) -> bool {
        self.commands.is_empty()
    }
}

pub struct PendingGuard<'a> {
    flags: &'a PendingFlags,
    command: EngineCommand,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.flags.counts[self.command.index()].fetch_sub(1, Ordering::SeqCst);
    }
}
