//! Kernel text symbols from `/proc/kallsyms`, used to render captured stacks
//! and to find the (possibly suffixed) names of the overlay predicates.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

pub const PROC_KALLSYMS: &str = "/proc/kallsyms";

#[derive(thiserror::Error, Debug)]
pub enum KsymsError {
    #[error("could not read kernel symbols: {0}")]
    IO(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Ksym {
    addr: u64,
    name: String,
}

/// Text symbols of the running kernel sorted by address.
#[derive(Debug, Default)]
pub struct Ksyms {
    syms: Vec<Ksym>,
}

impl Ksyms {
    /// Reads `/proc/kallsyms`.
    pub fn load() -> Result<Self, KsymsError> {
        Self::from_path(PROC_KALLSYMS)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, KsymsError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parses the `<addr> <type> <name> [module]` lines of the kallsyms
    /// format, keeping only text (`t`/`T`) symbols. Malformed lines are
    /// skipped.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, KsymsError> {
        let mut syms = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let mut fields = line.split_whitespace();
            let (addr, kind, name) = match (fields.next(), fields.next(), fields.next()) {
                (Some(addr), Some(kind), Some(name)) => (addr, kind, name),
                _ => continue,
            };
            if kind != "t" && kind != "T" {
                continue;
            }
            let addr = match u64::from_str_radix(addr, 16) {
                Ok(addr) => addr,
                Err(_) => continue,
            };
            syms.push(Ksym {
                addr,
                name: name.to_owned(),
            });
        }
        syms.sort_by_key(|sym| sym.addr);
        Ok(Self { syms })
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// Renders `addr` as `name` or `name+0xoff` using the closest symbol at
    /// or below it, or as a bare hex address when there is none.
    pub fn resolve(&self, addr: u64) -> String {
        let idx = self.syms.partition_point(|sym| sym.addr <= addr);
        if idx == 0 {
            return format!("{addr:#x}");
        }
        let sym = &self.syms[idx - 1];
        match addr - sym.addr {
            0 => sym.name.clone(),
            off => format!("{}+{off:#x}", sym.name),
        }
    }

    /// Renders a captured stack innermost frame first, frames joined by
    /// ` <- `.
    pub fn format_stack(&self, stack: &[u64]) -> String {
        stack
            .iter()
            .map(|addr| self.resolve(*addr))
            .collect::<Vec<_>>()
            .join(" <- ")
    }

    /// Finds the attachable name of a kernel function: the exact name, or
    /// the first compiler-specialized variant such as `name.isra.0`.
    pub fn find_symbol(&self, name: &str) -> Option<&str> {
        if let Some(sym) = self.syms.iter().find(|sym| sym.name == name) {
            return Some(&sym.name);
        }
        self.syms
            .iter()
            .find(|sym| {
                sym.name
                    .strip_prefix(name)
                    .map_or(false, |rest| rest.starts_with('.'))
            })
            .map(|sym| sym.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use tempfile::NamedTempFile;

    static KALLSYMS: &str = "\
ffffffff81000000 T _stext
ffffffff81000100 t do_one_initcall
ffffffff82000000 D some_data
ffffffff81001000 T vfs_mkdir
ffffffffc0a01000 t ovl_inuse_trylock.isra.0\t[overlay]
ffffffffc0a02000 t ovl_is_inuse\t[overlay]
garbage
zzzz T not_hex
";

    fn ksyms() -> Ksyms {
        Ksyms::from_reader(KALLSYMS.as_bytes()).unwrap()
    }

    #[test]
    fn parse_keeps_text_symbols() {
        let ksyms = ksyms();
        assert_eq!(ksyms.len(), 5);
        assert!(ksyms.find_symbol("some_data").is_none());
    }

    #[test]
    fn resolve_exact_and_offset() {
        let ksyms = ksyms();
        assert_eq!(ksyms.resolve(0xffffffff81001000), "vfs_mkdir");
        assert_eq!(ksyms.resolve(0xffffffff81001042), "vfs_mkdir+0x42");
        assert_eq!(ksyms.resolve(0xffffffff81000180), "do_one_initcall+0x80");
    }

    #[test]
    fn resolve_below_first_symbol() {
        let ksyms = ksyms();
        assert_eq!(ksyms.resolve(0x1000), "0x1000");
        assert_eq!(Ksyms::default().resolve(0xffffffff81000000), "0xffffffff81000000");
    }

    #[test]
    fn format_stack_joins_frames() {
        let ksyms = ksyms();
        assert_eq!(
            ksyms.format_stack(&[0xffffffff81001010, 0xffffffff81000000]),
            "vfs_mkdir+0x10 <- _stext"
        );
        assert_eq!(ksyms.format_stack(&[]), "");
    }

    #[test]
    fn find_symbol_accepts_suffixed_variants() {
        let ksyms = ksyms();
        assert_eq!(ksyms.find_symbol("ovl_is_inuse"), Some("ovl_is_inuse"));
        assert_eq!(
            ksyms.find_symbol("ovl_inuse_trylock"),
            Some("ovl_inuse_trylock.isra.0")
        );
        assert_eq!(ksyms.find_symbol("ovl_inuse"), None);
        assert_eq!(ksyms.find_symbol("ovl_workdir_create"), None);
    }

    #[test]
    fn from_path_reads_file() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(KALLSYMS.as_bytes()).unwrap();
        let ksyms = Ksyms::from_path(f.path()).unwrap();
        assert_eq!(ksyms.len(), 5);
    }
}
