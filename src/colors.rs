use owo_colors::{OwoColorize, Style, Styled};
use supports_color::Stream;

/// Styles any value for stderr, keeping plain text when the stream has no
/// color support.
pub trait ErrStyle {
    fn errstyle(&self, style: Style) -> Styled<&Self>;
}

impl<D> ErrStyle for D {
    fn errstyle(&self, style: Style) -> Styled<&Self> {
        self.style(
            supports_color::on(Stream::Stderr)
                .filter(|level| level.has_basic)
                .map_or_else(Style::new, |_| style),
        )
    }
}
