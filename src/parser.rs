// ===============================
// src/parser.rs
// ===============================
//
// Workload lines look like:
//   [1] ADD,oY01WVirLr,63511.53
//   [2] BUY,oY01WVirLr,S,1234.00
//   [99] DUMPLOG,./testLOG          (admin form, no user)
//
// Stray spaces are dropped and kind names match case-insensitively.
//
use crate::domain::{Command, CommandKind};
use crate::error::TradeError;

pub fn parse_line(line: &str) -> Result<Command, TradeError> {
    let bad = |why: &str| TradeError::InvalidFormat(format!("{why}: {line:?}"));

    let rest = line.trim().strip_prefix('[').ok_or_else(|| bad("missing [id]"))?;
    let (id, body) = rest.split_once(']').ok_or_else(|| bad("missing ]"))?;
    let id: u64 = id.trim().parse().map_err(|_| bad("non-numeric id"))?;

    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let mut parts = compact.split(',');
    let kind = match parts.next() {
        Some(k) if !k.is_empty() => CommandKind::from_name(k),
        _ => return Err(bad("missing command")),
    };
    let fields: Vec<String> = parts.map(str::to_string).collect();

    let (user_id, args) = match (&kind, fields.as_slice()) {
        // admin dump: the only field is the file name
        (CommandKind::DumpLog, [file]) => (String::new(), vec![file.clone()]),
        (_, [user, rest @ ..]) if !user.is_empty() => (user.clone(), rest.to_vec()),
        _ => return Err(bad("missing user id")),
    };

    Ok(Command { id, kind, user_id, args })
}
