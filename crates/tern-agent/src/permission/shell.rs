//! Splitting shell command lines into simple commands
//!
//! Rules name simple commands (`git:*`, `rm:*`), while the model sends whole
//! lines such as `cd build && rm -rf out`. A line is cut at `&&`, `||`, `;`,
//! `|`, `&` and newlines that sit outside quotes, so each part can be checked
//! on its own.

/// A command line cut at its control operators
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompoundCommand {
    /// Simple commands in order, trimmed, without leading variable assignments
    pub parts: Vec<String>,
    /// `$(..)`, `<(..)`, `>(..)` or backticks outside single quotes
    pub has_substitution: bool,
}

impl CompoundCommand {
    pub fn parse(command: &str) -> Self {
        let mut out = Self::default();
        let mut current = String::new();
        let mut quote: Option<char> = None;
        let mut chars = command.chars().peekable();

        while let Some(c) = chars.next() {
            match quote {
                Some('\'') => {
                    current.push(c);
                    if c == '\'' {
                        quote = None;
                    }
                    continue;
                }
                Some(_) => {
                    current.push(c);
                    match c {
                        '\\' => current.extend(chars.next()),
                        '"' => quote = None,
                        '`' => out.has_substitution = true,
                        '$' if chars.peek() == Some(&'(') => out.has_substitution = true,
                        _ => {}
                    }
                    continue;
                }
                None => {}
            }

            match c {
                '\\' => {
                    current.push(c);
                    current.extend(chars.next());
                }
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                '`' => {
                    out.has_substitution = true;
                    current.push(c);
                }
                '$' | '<' | '>' if chars.peek() == Some(&'(') => {
                    out.has_substitution = true;
                    current.push(c);
                }
                ';' | '\n' => out.push(&mut current),
                // `2>&1` and `&>` are redirections, not operators
                '&' if current.ends_with('>') || chars.peek() == Some(&'>') => current.push(c),
                '&' | '|' => {
                    if chars.peek() == Some(&c) || (c == '|' && chars.peek() == Some(&'&')) {
                        chars.next();
                    }
                    out.push(&mut current);
                }
                _ => current.push(c),
            }
        }
        out.push(&mut current);
        out
    }

    fn push(&mut self, current: &mut String) {
        let part = strip_assignments(current.trim_matches(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | '{' | '}')));
        if !part.is_empty() {
            self.parts.push(part.to_string());
        }
        current.clear();
    }
}

/// Drop `NAME=value` words in front of a command
fn strip_assignments(mut part: &str) -> &str {
    loop {
        let word_end = part.find(char::is_whitespace).unwrap_or(part.len());
        let word = &part[..word_end];
        let is_assignment = word.split_once('=').is_some_and(|(name, _)| {
            name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
        if !is_assignment || word_end == part.len() {
            return part;
        }
        part = part[word_end..].trim_start();
    }
}

/// Simple commands of a line, in order
pub fn split_command(command: &str) -> Vec<String> {
    CompoundCommand::parse(command).parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_on_control_operators() {
        assert_eq!(
            split_command("git status && rm -rf ~"),
            vec!["git status", "rm -rf ~"]
        );
        assert_eq!(
            split_command("make || echo failed; ls | wc -l & wait"),
            vec!["make", "echo failed", "ls", "wc -l", "wait"]
        );
        assert_eq!(split_command("cargo build 2>&1 |& tee log"), vec!["cargo build 2>&1", "tee log"]);
        assert_eq!(split_command("echo hi &> out.txt"), vec!["echo hi &> out.txt"]);
        assert_eq!(split_command("a\nb"), vec!["a", "b"]);
    }

    #[test]
    fn test_quotes_and_escapes_do_not_split() {
        assert_eq!(split_command("echo 'a && b'"), vec!["echo 'a && b'"]);
        assert_eq!(split_command(r#"git commit -m "x; y""#), vec![r#"git commit -m "x; y""#]);
        assert_eq!(split_command(r"echo a \; rm b"), vec![r"echo a \; rm b"]);
    }

    #[test]
    fn test_grouping_and_assignments_are_stripped() {
        assert_eq!(split_command("(cd x && rm -rf y)"), vec!["cd x", "rm -rf y"]);
        assert_eq!(split_command("RUST_LOG=debug FOO=1 cargo test"), vec!["cargo test"]);
        assert_eq!(split_command("FOO=1"), vec!["FOO=1"]);
        assert!(split_command("  ;; && ").is_empty());
    }

    #[test]
    fn test_substitution_is_flagged() {
        assert!(CompoundCommand::parse("echo $(rm -rf x)").has_substitution);
        assert!(CompoundCommand::parse("echo `id`").has_substitution);
        assert!(CompoundCommand::parse(r#"echo "$(id)""#).has_substitution);
        assert!(CompoundCommand::parse("diff <(ls a) b").has_substitution);
        assert!(!CompoundCommand::parse("echo '$(id)'").has_substitution);
        assert!(!CompoundCommand::parse("echo $HOME").has_substitution);
    }
}
