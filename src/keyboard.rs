use teloxide::types::{KeyboardButton, KeyboardMarkup};

pub(crate) fn start_keyboard() -> KeyboardMarkup {
    let keyboard = vec![vec![
        KeyboardButton::new("/register"),
        KeyboardButton::new("/help"),
    ]];

    KeyboardMarkup::new(keyboard)
}
