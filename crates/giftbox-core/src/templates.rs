//! Message templates and Discord markup helpers.

use crate::types::{MemberId, RoleId};

pub const NO_WINNERS: &str = "Could not pick any winners for the giveaway of **{prize}**!";
pub const TIMER_ENDED: &str = "The timer for **{title}** has ended.";

/// Substitute `{name}` placeholders literally. Unknown placeholders are kept.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

pub fn mention(member: MemberId) -> String {
    format!("<@{member}>")
}

pub fn role_mention(role: RoleId) -> String {
    format!("<@&{role}>")
}

/// Comma separated member mentions, in the given order.
pub fn mention_list(members: &[MemberId]) -> String {
    members.iter().map(|m| mention(*m)).collect::<Vec<_>>().join(", ")
}

pub fn bold(text: &str) -> String {
    format!("**{text}**")
}

pub fn no_winners(prize: &str) -> String {
    render(NO_WINNERS, &[("prize", prize)])
}

pub fn timer_ended(title: &str) -> String {
    render(TIMER_ENDED, &[("title", title)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let text = render(
            "Congratulations {winners}! You won {prize}!",
            &[("winners", "<@1>, <@2>"), ("prize", "Nitro")],
        );
        assert_eq!(text, "Congratulations <@1>, <@2>! You won Nitro!");
        assert_eq!(render("{unknown} {prize}", &[("prize", "x")]), "{unknown} x");
    }

    #[test]
    fn test_fixed_texts() {
        assert_eq!(no_winners("Nitro"), "Could not pick any winners for the giveaway of **Nitro**!");
        assert_eq!(timer_ended("Raid"), "The timer for **Raid** has ended.");
        assert_eq!(mention_list(&[3, 1]), "<@3>, <@1>");
        assert_eq!(role_mention(5), "<@&5>");
        assert_eq!(bold("hi"), "**hi**");
    }
}
