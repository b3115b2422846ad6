/// Default dialogue, one line per turn. Reused cyclically past the end.
pub const DEFAULT_LINES: &[&str] = &[
    "Hello !",
    "Ca va de ton cote ?",
    "Tu fais quoi en ce moment ?",
    "La journee s est bien passee ?",
    "Tu as mange ?",
    "Des nouvelles a partager ?",
    "Tu bosses sur quoi ces derniers temps ?",
    "Toujours la ?",
    "On se capte bientot !",
    "Prends soin de toi.",
];

/// Ordered, repeating sequence of scripted lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    lines: Vec<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            lines: DEFAULT_LINES.iter().map(|l| l.to_string()).collect(),
        }
    }
}

impl Script {
    /// Falls back to the default lines when `lines` is empty.
    pub fn new(lines: Vec<String>) -> Self {
        if lines.is_empty() {
            return Self::default();
        }
        Self { lines }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Line for `turn` (1-based): `lines[(turn - 1) mod len]`. Turn 0 maps to the first line.
    pub fn line(&self, turn: u32) -> &str {
        let idx = turn.saturating_sub(1) as usize % self.lines.len();
        &self.lines[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_turn_is_first_line() {
        let script = Script::default();
        assert_eq!(script.line(1), "Hello !");
        assert_eq!(script.line(10), "Prends soin de toi.");
    }

    #[test]
    fn lines_repeat_cyclically() {
        let script = Script::default();
        let len = script.len() as u32;
        for turn in 1..=len {
            for k in 0..4 {
                assert_eq!(script.line(turn), script.line(turn + k * len));
            }
        }
    }

    #[test]
    fn custom_script_cycles_over_its_own_length() {
        let script = Script::new(vec!["a".into(), "b".into(), "c".into()]);
        let lines: Vec<&str> = (1..=7).map(|t| script.line(t)).collect();
        assert_eq!(lines, vec!["a", "b", "c", "a", "b", "c", "a"]);
        assert_eq!(Script::new(vec![]), Script::default());
    }
}
