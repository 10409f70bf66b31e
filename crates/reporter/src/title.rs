//! Step titles and the arguments substituted into them

use std::fmt::Display;

use stepwise_common::Parameter;

/// Named values available to a step title.
///
/// `arguments` are the bound call arguments; each also becomes a visible step
/// parameter. `attributes` are scalar values of the receiver and are only
/// used for title substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    arguments: Vec<(String, String)>,
    attributes: Vec<(String, String)>,
    positional: usize,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named call argument
    pub fn arg(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.arguments.push((name.into(), value.to_string()));
        self
    }

    /// Add an unnamed call argument, exposed as `arg0`, `arg1`, ...
    pub fn positional(mut self, value: impl Display) -> Self {
        let name = format!("arg{}", self.positional);
        self.positional += 1;
        self.arg(name, value)
    }

    /// Add a receiver attribute
    pub fn attr(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.attributes.push((name.into(), value.to_string()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty() && self.attributes.is_empty()
    }

    /// Value for a placeholder; call arguments shadow receiver attributes
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.arguments
            .iter()
            .chain(self.attributes.iter())
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// One visible parameter per call argument, in order
    pub fn parameters(&self) -> Vec<Parameter> {
        self.arguments
            .iter()
            .map(|(name, value)| Parameter::visible(name.clone(), value))
            .collect()
    }
}

/// Values a decorated step function exposes to its title
pub trait StepArgs {
    fn step_args(&self) -> Args;
}

impl StepArgs for Args {
    fn step_args(&self) -> Args {
        self.clone()
    }
}

impl StepArgs for () {
    fn step_args(&self) -> Args {
        Args::new()
    }
}

impl<T: StepArgs + ?Sized> StepArgs for &T {
    fn step_args(&self) -> Args {
        (**self).step_args()
    }
}

/// Substitute `{name}` placeholders in `template`.
///
/// `{{` and `}}` render literal braces. A format specifier or conversion after the
/// name (`{count:>3}`, `{name!r}`) is accepted and ignored. If any placeholder
/// is unknown, empty, or the braces are unbalanced, the template is returned
/// unchanged.
pub fn format_title(template: &str, args: &Args) -> String {
    try_format(template, args).unwrap_or_else(|| template.to_string())
}

fn try_format(template: &str, args: &Args) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return None,
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next()? {
                        '}' => break,
                        '{' => return None,
                        ch => field.push(ch),
                    }
                }
                let key = field
                    .split(|ch: char| ch == ':' || ch == '!')
                    .next()
                    .unwrap_or_default();
                if key.is_empty() {
                    return None;
                }
                out.push_str(args.lookup(key)?);
            }
            _ => out.push(c),
        }
    }

    Some(out)
}
