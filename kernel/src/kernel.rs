//! The module containing the [`Kernel`] type: the top-level value created
//! once in `main`, bootstrapping the VM, the process, the log sinks, and
//! the first task from a resolved command line.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cli::{resolve_mnt_root, Cli};
use crate::elf;
use crate::error::StartupError;
use crate::strace::Strace;
use crate::task::{self, Process, Task};
use crate::vmm::Vm;

/// Owns everything `main` needs handed off to the first task's run loop:
/// the hypervisor VM, the process singleton, and the resolved mount root.
/// Unlike the teacher's `GlobalState`, nothing here is reached through an
/// ambient global — `main` builds one `Kernel`, takes the `Process`/`Task`
/// pair out of it, and every later clone gets its own `Arc<Process>`
/// clone instead of recovering state from a static.
pub(crate) struct Kernel {
    vm: Arc<Vm>,
    root: PathBuf,
}

impl Kernel {
    /// Creates the hypervisor VM and resolves the mount root. Does not load
    /// the guest or create any VCPU; see [`Self::bootstrap`].
    pub(crate) fn new(cli: &Cli) -> Result<Self, StartupError> {
        let root = resolve_mnt_root(cli).map_err(|_| StartupError::ResolveMountRoot(
            cli.mnt.clone().unwrap_or_default(),
        ))?;
        let vm = Arc::new(Vm::create());
        Ok(Self { vm, root })
    }

    pub(crate) fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub(crate) fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Loads `cli.elf` into the VM, builds the initial guest stack, and
    /// returns the process singleton along with its first task, ready for
    /// `task::run_loop`.
    pub(crate) fn bootstrap(
        self,
        cli: &Cli,
        strace: Option<Strace>,
    ) -> Result<(Arc<Process>, Task), StartupError> {
        let loaded = elf::load(&self.vm, &cli.elf, &cli.args)?;
        let (process, first_task) =
            task::spawn_initial(self.vm, self.root, strace, loaded.entry, loaded.stack_top);
        Ok((process, first_task))
    }
}
