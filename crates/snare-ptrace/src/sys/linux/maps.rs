use std::path::Path;

use indexmap::IndexMap;
use snare_engine::{Address, ModuleInfo};

use super::{Error, Result};

/// Single line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Mapping<'a> {
    start: u64,
    end: u64,
    path: Option<&'a str>,
}

fn parse_line(line: &str) -> Result<Mapping<'_>> {
    let malformed = || Error::MalformedMaps(line.to_owned());

    // address perms offset dev inode [pathname]
    let mut fields = line.splitn(6, ' ');

    let range = fields.next().ok_or_else(malformed)?;
    let (start, end) = range.split_once('-').ok_or_else(malformed)?;
    let start = u64::from_str_radix(start, 16).map_err(|_| malformed())?;
    let end = u64::from_str_radix(end, 16).map_err(|_| malformed())?;

    if end < start {
        return Err(malformed());
    }

    for _ in 0..4 {
        fields.next().ok_or_else(malformed)?;
    }

    let path = fields
        .next()
        .map(|p| p.trim_start())
        .map(|p| p.strip_suffix(" (deleted)").unwrap_or(p))
        .filter(|p| p.starts_with('/'));

    Ok(Mapping { start, end, path })
}

/// Parses the content of `/proc/<pid>/maps` into the list of file-backed
/// modules.
///
/// All the mappings of a file make up one module, whose base address is the
/// lowest mapping start. Anonymous and pseudo mappings (`[heap]`, `[vdso]`...)
/// are skipped.
pub fn parse_modules(content: &str) -> Result<Vec<ModuleInfo>> {
    let mut ranges = IndexMap::<&str, (u64, u64)>::new();

    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let mapping = parse_line(line)?;

        let Some(path) = mapping.path else {
            continue;
        };

        ranges
            .entry(path)
            .and_modify(|(start, end)| {
                *start = (*start).min(mapping.start);
                *end = (*end).max(mapping.end);
            })
            .or_insert((mapping.start, mapping.end));
    }

    let modules = ranges
        .into_iter()
        .filter_map(|(path, (start, end))| {
            let name = Path::new(path).file_name()?.to_str()?;
            Some(ModuleInfo::new(name, Address::new(start), end - start))
        })
        .collect();

    Ok(modules)
}
