use crate::account::Account;
use crate::mailutils::{make_msg, parse_email, parse_raw, MessageDraft};
use crate::types::{Address, Mail, OutgoingAttachment};
use anyhow::Result;
use base64::Engine;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, SystemTime};

pub const DEMO_ACCOUNT: &str = "demo";
pub const DEMO_PASSWORD: &str = "demo";

/// Account used by `--generate-fake-mails`
pub fn demo_account() -> Account {
    Account::new(DEMO_ACCOUNT, "Demo User <demo@example.com>", DEMO_PASSWORD)
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// Generate a fake mail between `account` and `correspondent`
pub fn generate_fake_mail_with_rng(
    rng: &mut impl Rng,
    account: &Account,
    correspondent: &Address,
    incoming: bool,
) -> Result<Mail> {
    let subjects = [
        "Meeting Tomorrow",
        "Project Update",
        "Quick Question",
        "Follow Up",
        "Important Notice",
        "Weekly Report",
        "Action Required",
        "Thank You",
        "Reminder",
        "New Opportunity",
    ];

    let bodies = [
        "Hi there,\n\nJust wanted to follow up on our previous conversation.\n\nBest regards",
        "Hello,\n\nI hope this email finds you well.\n\nLooking forward to your response.",
        "Dear colleague,\n\nI wanted to share some important information with you.\n\nBest",
        "Hi,\n\nQuick question - could you please provide an update?\n\nThanks!",
        "Hello,\n\nThis is a friendly reminder about the upcoming deadline.\n\nRegards",
    ];

    let me = parse_email(&account.address)?;
    let (from, to) = if incoming {
        (correspondent.clone(), me)
    } else {
        (me, correspondent.clone())
    };

    let mut attachments = Vec::new();
    // Roughly one mail in four carries a small report
    if rng.gen_range(0..4) == 0 {
        let content = format!("Fake attachment content {}", rng.gen::<u32>());
        attachments.push(OutgoingAttachment {
            filename: "report.txt".to_string(),
            b64: base64::engine::general_purpose::STANDARD.encode(content),
            content_type: None,
        });
    }

    let age = Duration::from_secs(rng.gen_range(0..86400 * 30)); // Random time in last 30 days
    let draft = MessageDraft {
        subject: subjects[rng.gen_range(0..subjects.len())].to_string(),
        content: bodies[rng.gen_range(0..bodies.len())].to_string(),
        from,
        tos: vec![to],
        attachments,
        date: Some(SystemTime::now() - age),
        ..Default::default()
    };

    let message = make_msg(&draft)?;
    parse_raw(&account.name, &message.formatted(), incoming)
}

/// Generate fake correspondent addresses with a seed
pub fn generate_fake_addresses_with_seed(count: usize, seed: Option<u64>) -> Vec<Address> {
    let mut rng = seeded_rng(seed);

    let domains = ["example.com", "test.org", "demo.net", "fake.io", "sample.com"];
    let names = [
        "alice", "bob", "charlie", "diana", "eve", "frank", "grace", "henry",
        "iris", "jack", "kate", "liam", "mia", "noah", "olivia", "paul",
    ];

    (0..count)
        .map(|i| {
            let name = if i < names.len() {
                names[i].to_string()
            } else {
                format!("user{}", i)
            };
            let domain = domains[rng.gen_range(0..domains.len())];
            let mut display = name.clone();
            if let Some(first) = display.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            Address::new(display, format!("{}@{}", name, domain))
        })
        .collect()
}

/// Generate `count` fake mails for `account` with a seed for deterministic content
pub fn generate_fake_mails_with_seed(account: &Account, count: usize, seed: Option<u64>) -> Result<Vec<Mail>> {
    let mut rng = seeded_rng(seed);
    let pool = generate_fake_addresses_with_seed((count / 3).clamp(1, 16), seed);

    let mut mails = Vec::with_capacity(count);
    for _ in 0..count {
        let correspondent = &pool[rng.gen_range(0..pool.len())];
        // Two thirds of the traffic is incoming
        let incoming = rng.gen_range(0..3) != 0;
        mails.push(generate_fake_mail_with_rng(&mut rng, account, correspondent, incoming)?);
    }
    Ok(mails)
}
