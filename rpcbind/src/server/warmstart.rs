//! Keeping registrations across restarts.

use std::{
    fs,
    io::{self, Cursor},
    path::PathBuf,
};

use crate::common::{
    rpcbind::xdr::{List, Rpcb},
    xdr::basic::{XdrDecode, XdrEncode},
};

use super::registry::ServiceBinding;

/// Storage for the registry between runs
pub trait PersistenceHook: Send + Sync {
    fn save(&self, bindings: &[ServiceBinding]) -> io::Result<()>;

    fn load(&self) -> io::Result<Vec<ServiceBinding>>;
}

/// Registrations do not survive a restart
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPersistence;

impl PersistenceHook for NoPersistence {
    fn save(&self, _bindings: &[ServiceBinding]) -> io::Result<()> {
        Ok(())
    }

    fn load(&self) -> io::Result<Vec<ServiceBinding>> {
        Ok(Vec::new())
    }
}

/// An XDR encoded `rpcblist` in a file, removed once loaded.
#[derive(Debug, Clone)]
pub struct WarmstartFile {
    path: PathBuf,
}

impl WarmstartFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PersistenceHook for WarmstartFile {
    fn save(&self, bindings: &[ServiceBinding]) -> io::Result<()> {
        let list = List(bindings.iter().cloned().map(Rpcb::from).collect());
        let mut cursor = Cursor::new(Vec::new());
        list.write_xdr(&mut cursor)?;
        fs::write(&self.path, cursor.into_inner())
    }

    fn load(&self) -> io::Result<Vec<ServiceBinding>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        fs::remove_file(&self.path)?;

        let mut list = List::<Rpcb>::default();
        list.read_xdr(&mut Cursor::new(data))?;
        Ok(list.0.into_iter().map(ServiceBinding::from).collect())
    }
}
