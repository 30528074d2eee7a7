use crate::journal::RecBody;
use std::{
    fs::File,
    io::{BufRead, BufReader, Write},
    path::Path,
};

pub fn write_snapshot(path: &Path, records: &[RecBody]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    let mut z = zstd::Encoder::new(file, 3)?;
    for rec in records {
        let line = serde_json::to_vec(rec)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        z.write_all(&line)?;
        z.write_all(b"\n")?;
    }
    z.finish()?;
    Ok(())
}

// Lines that fail to decode are skipped.
pub fn read_snapshot(path: &Path) -> std::io::Result<Vec<RecBody>> {
    let file = File::open(path)?;
    let decoder = zstd::Decoder::new(file)?;
    let br = BufReader::new(decoder);
    let mut out = Vec::new();
    for line in br.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(rec) = serde_json::from_str::<RecBody>(&line) {
            out.push(rec);
        }
    }
    Ok(out)
}
