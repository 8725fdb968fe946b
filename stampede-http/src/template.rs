use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::Rng as _;
use rand::seq::SliceRandom as _;
use stampede_core::{ErrorKind, ScenarioContext, ScenarioFailure};

/// Values captured from earlier responses of the same iteration.
pub type Captures = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid template `{template}`: {reason}")]
pub struct TemplateError {
    pub template: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Vu,
    Iter,
    Rand { min: i64, max: i64 },
    Pick(Vec<String>),
    Data(String),
}

/// A string with `${..}` placeholders, parsed once and rendered per execution.
///
/// - `${vu}`: worker id
/// - `${iter}`: worker iteration
/// - `${rand:A:B}`: uniform integer in `A..=B`
/// - `${pick:a|b|c}`: one of the listed values
/// - `${key}`: a value captured earlier in the iteration, else the run data value under `key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let err = |reason: String| TemplateError {
            template: raw.to_string(),
            reason,
        };

        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = raw;
        while let Some(start) = rest.find("${") {
            literal.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| err("unterminated `${`".to_string()))?;
            let placeholder = after[..end].trim();
            if !literal.is_empty() {
                parts.push(Part::Literal(std::mem::take(&mut literal)));
            }
            parts.push(parse_placeholder(placeholder).map_err(err)?);
            rest = &after[end + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// No placeholders; renders to the raw string.
    pub fn is_static(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }

    /// Capture or run data keys the template reads.
    pub fn data_keys(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            Part::Data(key) => Some(key.as_str()),
            _ => None,
        })
    }

    pub fn render(&self, ctx: &mut ScenarioContext) -> Result<String, ScenarioFailure> {
        self.render_with(ctx, &Captures::new())
    }

    pub fn render_with(
        &self,
        ctx: &mut ScenarioContext,
        captures: &Captures,
    ) -> Result<String, ScenarioFailure> {
        if self.is_static() {
            return Ok(self.raw.clone());
        }
        let mut out = String::with_capacity(self.raw.len());
        for part in &self.parts {
            match part {
                Part::Literal(s) => out.push_str(s),
                Part::Vu => out.push_str(&ctx.vu_id.to_string()),
                Part::Iter => out.push_str(&ctx.iteration.to_string()),
                Part::Rand { min, max } => out.push_str(&ctx.rng.gen_range(*min..=*max).to_string()),
                Part::Pick(choices) => {
                    if let Some(choice) = choices.choose(&mut ctx.rng) {
                        out.push_str(choice);
                    }
                }
                Part::Data(key) => {
                    match captures.get(key).map(String::as_str).or_else(|| ctx.data.get(key)) {
                        Some(v) => out.push_str(v),
                        None => {
                            return Err(ScenarioFailure::new(
                                ErrorKind::Parse,
                                format!("no value for `{key}` in template `{}`", self.raw),
                            ));
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

fn parse_placeholder(placeholder: &str) -> Result<Part, String> {
    match placeholder.split_once(':') {
        None if placeholder.is_empty() => Err("empty placeholder `${}`".to_string()),
        None if placeholder == "vu" => Ok(Part::Vu),
        None if placeholder == "iter" => Ok(Part::Iter),
        None => Ok(Part::Data(placeholder.to_string())),
        Some(("rand", range)) => {
            let (a, b) = range
                .split_once(':')
                .ok_or_else(|| format!("`rand` needs `rand:MIN:MAX`, got `{range}`"))?;
            let min: i64 = a
                .trim()
                .parse()
                .map_err(|_| format!("`{a}` is not an integer"))?;
            let max: i64 = b
                .trim()
                .parse()
                .map_err(|_| format!("`{b}` is not an integer"))?;
            if min > max {
                return Err(format!("`rand` range {min}..={max} is empty"));
            }
            Ok(Part::Rand { min, max })
        }
        Some(("pick", choices)) => {
            let choices: Vec<String> = choices
                .split('|')
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
            if choices.is_empty() {
                return Err("`pick` needs at least one choice".to_string());
            }
            Ok(Part::Pick(choices))
        }
        Some((other, _)) => Err(format!("unknown placeholder function `{other}`")),
    }
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
