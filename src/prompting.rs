use std::sync::LazyLock;

use minijinja::{context, Environment, Value};
use tracing::warn;

const FALLBACK_RESPONSE_TEMPLATE: &str = include_str!("prompts/fallback_response.j2");
const WELCOME_TEMPLATE: &str = include_str!("prompts/welcome.j2");
const NO_HISTORY_TEMPLATE: &str = include_str!("prompts/no_history.j2");
const FEATURE_IN_DEVELOPMENT_TEMPLATE: &str = include_str!("prompts/feature_in_development.j2");

pub const LOGIN_REQUIRED_TEXT: &str = "Please log in to test your chatbot.";
pub const HISTORY_FAILED_TEXT: &str =
    "Failed to load your chat history. You can still type messages to test your bot.";
pub const HISTORY_FAILED_TOAST: &str = "Failed to load chat history";
pub const CLEARED_TEXT: &str = "Chat cleared. Type \"hello\" to see the main menu.";

static TEMPLATES: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    for (name, source) in [
        ("fallback_response", FALLBACK_RESPONSE_TEMPLATE),
        ("welcome", WELCOME_TEMPLATE),
        ("no_history", NO_HISTORY_TEMPLATE),
        ("feature_in_development", FEATURE_IN_DEVELOPMENT_TEMPLATE),
    ] {
        if let Err(err) = env.add_template(name, source) {
            warn!("template {name} failed to load: {err}");
        }
    }
    env
});

fn render(name: &str, ctx: Value) -> Option<String> {
    TEMPLATES.get_template(name).ok()?.render(ctx).ok()
}

pub struct FallbackResponseContext<'a> {
    pub input: &'a str,
    pub suggestions: &'a [String],
}

pub fn render_fallback_response(ctx: &FallbackResponseContext<'_>) -> String {
    render(
        "fallback_response",
        context! {
            input => ctx.input,
            suggestions => ctx.suggestions,
        },
    )
    .unwrap_or_else(|| fallback_fallback_response(ctx))
}

fn fallback_fallback_response(ctx: &FallbackResponseContext<'_>) -> String {
    let mut text = format!(
        "I don't have a specific response for \"{}\".",
        ctx.input
    );
    if !ctx.suggestions.is_empty() {
        text.push_str("\n\nHere are some things you can try:");
        for item in ctx.suggestions {
            text.push_str("\n• ");
            text.push_str(item);
        }
    }
    text.push_str("\n\nType \"hello\" to see the main menu.");
    text
}

pub fn render_welcome(username: &str) -> String {
    let username = username.trim();
    render(
        "welcome",
        context! { username => username },
    )
    .unwrap_or_else(|| {
        if username.is_empty() {
            "Welcome to the chatbot test console! Messages you send here are answered by your bot's flows.".to_string()
        } else {
            format!(
                "Welcome to the chatbot test console, {username}! Messages you send here are answered by your bot's flows."
            )
        }
    })
}

pub fn render_no_history(flow_count: usize) -> String {
    render(
        "no_history",
        context! { flow_count => flow_count },
    )
    .unwrap_or_else(|| {
        "Your chat history does not have enough conversations to show a full menu yet. \
         Chat with your bot on a connected platform and open the test console again. \
         You can still type \"hello\" to begin."
            .to_string()
    })
}

pub fn render_feature_in_development(title: &str) -> String {
    render(
        "feature_in_development",
        context! { title => title },
    )
    .unwrap_or_else(|| {
        format!("The \"{title}\" feature is currently in development. Please check back soon!")
    })
}

/// Canned reply for a main-menu button, keyed by lower-cased payload.
pub fn menu_button_text(payload: &str) -> Option<&'static str> {
    let text = match payload {
        "general_product" => {
            "Here are our products. Browse the catalog and tap any item to see details and prices."
        }
        "general_service" => {
            "Here are the services we offer. Choose one to see the details and book an appointment."
        }
        "faq" => {
            "Frequently asked questions:\n• How do I place an order?\n• Which payment methods do you accept?\n• How long does delivery take?\nAsk me any of these to learn more."
        }
        "support" => {
            "Our support team is here to help. Describe your issue and an agent will get back to you shortly."
        }
        "time" => "We are open Monday to Saturday, 9:00 AM to 6:00 PM.",
        "track" => "Please share your order number and I'll check the status of your order.",
        "cart" => "Your cart is currently empty. Browse our products to add items.",
        "log out" => "You have been logged out. Type \"hello\" whenever you want to start again.",
        "settings" => {
            "You can update your notification and language preferences from the settings menu."
        }
        _ => return None,
    };
    Some(text)
}
