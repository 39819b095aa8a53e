//! Item identifier input.

use std::io::BufRead;

use rand::Rng;
use rand::seq::SliceRandom;

/// Identifiers from `args`, or one per line from `reader` when `args` is empty
///
/// Surrounding whitespace is trimmed and blank lines are skipped.
pub fn read_identifiers<R: BufRead>(args: &[String], reader: R) -> std::io::Result<Vec<String>> {
    if !args.is_empty() {
        return Ok(args
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect());
    }

    let mut items = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            items.push(trimmed.to_string());
        }
    }
    Ok(items)
}

/// Shuffle item order once, before scheduling
///
/// Files within an item keep the order the service lists them in; only items move.
pub fn shuffle_items<R: Rng + ?Sized>(items: &mut [String], rng: &mut R) {
    items.shuffle(rng);
}
