use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{debug, info};

use crate::codemap::CodeMap;
use crate::error::{Error, Result};
use crate::executable::Executable;

/// Ordered instruction shape fingerprints of one routine.
pub type SignatureString = Vec<u32>;

/// Bounded Levenshtein distance between two sequences using the two-row
/// dynamic programming formulation. Once no cell of the current row is at
/// or below `threshold` the result can only grow, so the search bails out
/// and reports `u32::MAX`.
pub fn edit_distance<T: PartialEq>(a: &[T], b: &[T], threshold: u32) -> u32 {
    let mut rows = [vec![0u32; b.len() + 1], vec![0u32; b.len() + 1]];
    for (j, cell) in rows[0].iter_mut().enumerate() {
        *cell = j as u32;
    }
    for i in 1..=a.len() {
        let (prev, cur) = if i % 2 == 1 {
            let (lo, hi) = rows.split_at_mut(1);
            (&lo[0], &mut hi[0])
        } else {
            let (lo, hi) = rows.split_at_mut(1);
            (&hi[0], &mut lo[0])
        };
        cur[0] = prev[0] + 1;
        let mut below_threshold = false;
        for j in 1..=b.len() {
            let subst = prev[j - 1] + if a[i - 1] == b[j - 1] { 0 } else { 1 };
            cur[j] = subst.min(prev[j] + 1).min(cur[j - 1] + 1);
            if cur[j] <= threshold {
                below_threshold = true;
            }
        }
        if !below_threshold {
            return u32::MAX;
        }
    }
    rows[a.len() % 2][b.len()]
}

#[derive(Debug, Clone)]
pub struct SignatureItem {
    pub routine_name: String,
    pub signature: SignatureString,
}

impl SignatureItem {
    pub fn len(&self) -> usize {
        self.signature.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signature.is_empty()
    }
}

/// A collection of routine fingerprints, extracted from an executable or
/// loaded from its text form, used for duplicate lookup.
pub struct SignatureLibrary {
    sigs: Vec<SignatureItem>,
}

impl SignatureLibrary {
    /// Extracts signatures for every non-ignored routine of the map whose
    /// main block decodes to between `min_instructions` and
    /// `max_instructions` instructions (zero max meaning unbounded).
    pub fn from_map(
        map: &CodeMap,
        exe: &Executable,
        min_instructions: usize,
        max_instructions: usize,
    ) -> Self {
        let mut sigs = Vec::new();
        for routine in map.routines() {
            if routine.is_ignored() {
                debug!("ignoring routine: {}", routine);
                continue;
            }
            let block = routine.main_block();
            if !block.is_valid() {
                debug!("routine {} has no main block, ignoring", routine.name);
                continue;
            }
            let sig = match exe.signatures(&block) {
                Ok(s) => s,
                Err(e) => {
                    debug!("unable to extract signature for {}: {}", routine.name, e);
                    continue;
                }
            };
            if sig.is_empty() {
                debug!("empty signature for routine {}, ignoring", routine.name);
            } else if sig.len() < min_instructions {
                debug!("routine {} too small: {} instructions", routine.name, sig.len());
            } else if max_instructions != 0 && sig.len() > max_instructions {
                debug!("routine {} too big: {} instructions", routine.name, sig.len());
            } else {
                debug!(
                    "extracted signature for routine {}, {} instructions",
                    routine.name,
                    sig.len()
                );
                sigs.push(SignatureItem { routine_name: routine.name.clone(), signature: sig });
            }
        }
        info!("extracted signatures for {} routines from executable", sigs.len());
        SignatureLibrary { sigs }
    }

    /// Loads the `name: hex,hex,...` text form.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)?;
        let mut sigs = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let lineno = lineno + 1;
            let line = line?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let colon = line.find(':').ok_or_else(|| {
                Error::parse_line(lineno, "routine name missing in signature file")
            })?;
            let routine_name = line[..colon].to_string();
            if routine_name.is_empty() {
                return Err(Error::parse_line(lineno, "empty routine name in signature file"));
            }
            let mut signature = SignatureString::new();
            for token in line[colon + 1..].split(',') {
                let token = token.trim();
                if token.is_empty() {
                    return Err(Error::parse_line(lineno, "signature string missing"));
                }
                let value = u32::from_str_radix(token, 16).map_err(|_| {
                    Error::parse_line(lineno, format!("invalid signature token '{}'", token))
                })?;
                signature.push(value);
            }
            debug!("loaded signature for routine {}, {} instructions", routine_name, signature.len());
            sigs.push(SignatureItem { routine_name, signature });
        }
        info!("loaded signatures for {} routines from {}", sigs.len(), path.display());
        Ok(SignatureLibrary { sigs })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.sigs.is_empty() {
            return Ok(());
        }
        let mut out = String::new();
        for si in &self.sigs {
            if si.is_empty() {
                continue;
            }
            out.push_str(&si.routine_name);
            out.push_str(": ");
            for (i, s) in si.signature.iter().enumerate() {
                if i != 0 {
                    out.push(',');
                }
                out.push_str(&format!("{:x}", s));
            }
            out.push('\n');
        }
        fs::write(path, out)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.sigs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sigs.len()
    }

    pub fn get(&self, idx: usize) -> &SignatureItem {
        &self.sigs[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SignatureItem> {
        self.sigs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{Address, Block};
    use crate::codemap::CodeMap;
    use crate::routine::Routine;

    #[test]
    fn test_edit_distance() {
        let s1: Vec<char> = "kitten".chars().collect();
        let s2: Vec<char> = "sitting".chars().collect();
        let s3: Vec<char> = "asdfvadfv".chars().collect();
        assert_eq!(edit_distance(&s1, &s1, 5), 0);
        assert_eq!(edit_distance(&s1, &s2, 5), 3);
        assert_eq!(edit_distance(&s1, &s3, 5), u32::MAX);
        // repeated invocation is stable
        assert_eq!(edit_distance(&s1, &s3, 5), u32::MAX);
        // empty sequences
        assert_eq!(edit_distance::<char>(&[], &[], 5), 0);
        assert_eq!(edit_distance(&[], &s1, 6), 6);
    }

    #[test]
    fn test_library_roundtrip() {
        let lib = SignatureLibrary {
            sigs: vec![
                SignatureItem { routine_name: "alpha".into(), signature: vec![0x17b8e9, 0x2d000] },
                SignatureItem { routine_name: "beta".into(), signature: vec![0x1] },
            ],
        };
        let file = tempfile::NamedTempFile::new().unwrap();
        lib.save(file.path()).unwrap();
        let loaded = SignatureLibrary::load(file.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(0).routine_name, "alpha");
        assert_eq!(loaded.get(0).signature, vec![0x17b8e9, 0x2d000]);
        assert_eq!(loaded.get(1).routine_name, "beta");
        assert_eq!(loaded.get(1).signature, vec![0x1]);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.sig");
        std::fs::write(&path, "no colon here\n").unwrap();
        assert!(SignatureLibrary::load(&path).is_err());
        std::fs::write(&path, "name: xyzzy\n").unwrap();
        assert!(SignatureLibrary::load(&path).is_err());
    }

    #[test]
    fn test_from_map_filters() {
        // mov ax; mov ax; ret / ignored routine / too-short routine
        let code = [
            0xb8u8, 0x34, 0x12, // mov ax, 0x1234
            0xb8, 0x78, 0x56, // mov ax, 0x5678
            0xc3, // ret
            0xc3, // ret (short routine)
        ];
        let exe = Executable::with_code(0x100, &code).unwrap();
        let mut map = CodeMap::new(0x100, code.len());
        let b1 = Block::new(Address::new(0x100, 0), Address::new(0x100, 6));
        let mut r1 = Routine::new("big", b1);
        r1.reachable.push(b1);
        let b2 = Block::new(Address::new(0x100, 7), Address::new(0x100, 7));
        let mut r2 = Routine::new("tiny", b2);
        r2.reachable.push(b2);
        let mut r3 = Routine::new("skipped", b1);
        r3.reachable.push(b1);
        r3.ignore = true;
        map.add_routine(r1);
        map.add_routine(r2);
        map.add_routine(r3);

        let lib = SignatureLibrary::from_map(&map, &exe, 2, 0);
        assert_eq!(lib.len(), 1);
        assert_eq!(lib.get(0).routine_name, "big");
        assert_eq!(lib.get(0).signature.len(), 3);
    }
}
