use std::borrow::Cow;
use std::io::{BufWriter, Write};

use ptree::print_config::UTF_CHARS;
use ptree::{write_tree_with, PrintConfig, Style, TreeItem};

use crate::predicate::Predicate;

impl<'a> TreeItem for &'a Predicate {
    type Child = Self;

    fn write_self<W: Write>(&self, f: &mut W, style: &Style) -> std::io::Result<()> {
        match self {
            Predicate::And(_) => write!(f, "{}", style.paint("AND")),
            Predicate::Or(_) => write!(f, "{}", style.paint("OR")),
            Predicate::Guarded { guard, .. } => write!(f, "{}", style.paint(format!("trigcond({})", guard))),
            other => write!(f, "{}", style.paint(other)),
        }
    }

    fn children(&self) -> Cow<[Self::Child]> {
        match self {
            Predicate::And(args) | Predicate::Or(args) => {
                Cow::from(args.iter().collect::<Vec<&'a Predicate>>())
            }
            Predicate::Guarded { pred, .. } => Cow::from(vec![&**pred]),
            _ => Cow::from(vec![]),
        }
    }
}

pub fn explain_condition<W: Write>(cond: &Predicate, output: &mut W) -> std::io::Result<()> {
    let config = PrintConfig {
        indent: 3,
        characters: UTF_CHARS.into(),
        ..Default::default()
    };
    write_tree_with(&cond, output, &config)
}

pub fn explain_condition_to_string(cond: &Predicate) -> std::io::Result<String> {
    let mut buf = BufWriter::new(Vec::new());

    explain_condition(cond, &mut buf)?;

    let bytes = buf.into_inner()?;
    String::from_utf8(bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use crate::predicate::test_util::{field, int};
    use crate::predicate::{explain_condition_to_string, Guard, Predicate};

    #[test]
    fn test_explain_condition() {
        let cond = Predicate::And(vec![
            Predicate::eq(field(0, 0, "a", false), int(1)),
            Predicate::guarded(
                Guard::Found(1),
                Predicate::Or(vec![
                    Predicate::IsNull(field(1, 0, "a", true)),
                    Predicate::eq(field(1, 1, "b", true), field(0, 1, "b", false)),
                ]),
            ),
        ]);

        let expected_result = "\
AND
├─ t0.a = 1
└─ trigcond(found(#1))
   └─ OR
      ├─ t1.a IS NULL
      └─ t1.b = t0.b
";
        let result = explain_condition_to_string(&cond).unwrap();
        assert_eq!(expected_result, result);
    }
}
