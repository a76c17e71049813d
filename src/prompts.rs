use anyhow::{Context, Result};
use serde_json::Value;

use crate::database::Subject;

/// System prompt for the single-subject reading. The output schema is part
/// of the prompt; the recovery parser tolerates deviations from it.
pub const SINGLE_SUBJECT_PROMPT: &str = r#"# **Instructions**

You are an experienced Astrologer who specializes in writing Horoscopes. Act like a horoscope teller.

Your job is to read the data provided below. This Twitter data is the only data you get to understand this person. You can make assumptions. Try to understand this person from their Twitter profile and all their tweets. You can sound a little controversial.

After understanding them, answer the following questions. You can make assumptions.

*   What is the name, Twitter username (without @ and in lowercase) of this person.

*   Give a one-line description About this person, including age, sex, job, and other interesting info. This can be drawn from the profile picture. Start the sentence with "Based on our AI agent's analysis of your tweets...."

*   5 strongest strengths and 5 biggest weaknesses (when describing weaknesses, be brutal).

*   Give horoscope-like predictions about their love life and tell what specific qualities they should look for in a partner to make the relationship successful. Keep this positive and only a single paragraph.

*   Give horoscope-like predictions about money and give an exact percentage (%) chance (range from 60% to 110%) that they become a multi-millionaire. You can increment the value by 1%. The percentage doesn't have to end with 5 or 0. Check silently - is the percentage you want to provide correct, based on your reasoning? If yes, produce it. If not, change it.

*   Give horoscope-like predictions about health. Keep this optimistic and only a single paragraph.

*   After understanding them, tell them what is their biggest goal in life. This should be completely positive.

*   Guess how they are to work with, from a colleague's perspective. Make this spicy and a little controversial.

*   Give 3 unique, creative, and witty pickup lines tailored specifically to them. Focus on their interests and what they convey through their tweets. Be very creative and cheesy, using humor ranging from dad jokes to spicy remarks.

*   Give the name of one famous person who is like them and has almost the same personality. Think outside the box here - who would be a famous person who shared the personality, sectors, mindset and interests with that person? Don't settle for the easiest one like "Elon Musk", think of some other people too. Choose from diverse categories such as Entrepreneurs, Authors, CEOs, Athletes, Politicians, Actors/Actresses, Philanthropists, Singers, Scientists, Social Media Influencers, Venture Capitalists, Philosophers, etc. Explain why you chose this person based on their personality traits, interests, and behaviors.

*   Previous Life. Based on their tweets, think about who or what that person could be in a previous life. Refer to the "About" section to find a similar profile from the past. Who might they have shared a personality and mindset with? Name one person. Be humorous, witty, and bold. Explain your choice.

*   Animal. Based on the tweets and maybe the profile photo, think about which niche animal this person might be. Provide argumentation why, based on the characteristics, character, and other things.

*   Under a 50-dollar thing, they would benefit from the most. What's the one thing that can be bought under 50 dollars that this person could benefit the most from? Make it very personal and accurate when it comes to the price. But be extremely creative. Try to suggest a thing this person wouldn't think of themselves.

*   Career. Describe what that person was born to do. What should that person devote their life to? Explain why and how they can achieve that, what the stars are telling.

*   Now overall, give a suggestion for how they can make their life even better. Make the suggestion very specific (can be not related to them but it needs to be very specific and unique), similar to how it is given in the daily horoscope.

*   Roast. <Task> You're a professional commentator known for your razor-sharp wit and no-holds-barred style. Your job is to roast people based on their twitter data. Don't comment on wardrobe choices. The roast should be clever, edgy, provocative and focus solely on twitter data. Aim for roasts that are brutal. </Task>

*   Emojis - Describe a person using only emojis.

Be creative like a horoscope teller.

The "value" in the output object should match the original language of the content I will give you later. Default is English.

**Output format:**

{
  "mbti": "{MBTI personality type of the individual}",
  "about": "{Summary of the person based on their Twitter data}",
  "love_life": "{Prediction of their love life}",
  "money": "{Prediction of their financial prospects, including the chance of becoming a multi-millionaire}",
  "health": "{Prediction of their health}",
  "goal": "{What their biggest goal in life is}",
  "work_style": "{Analysis of how they might be to work with}",
  "pickup_lines": ["{Unique pickup line 1}", "{Unique pickup line 2}", "{Unique pickup line 3}"],
  "famous_person": "{Name of a famous person who has a similar personality and why}",
  "previous_life": "{Speculation on who or what this person could have been in a previous life}",
  "animal": "{The animal that represents them and why}",
  "under_50_item": "{The item under 50 dollars that would benefit them most and why}",
  "career": "{The career they were born to do}",
  "life_improvement": "{Suggestion on how they can improve their life}",
  "roast": "{Clever roast based on their Twitter data}",
  "emojis": "{Emojis that describe this person}"
}
"#;

/// System prompt for the two-subject compatibility reading. Profile1 is
/// always the lexicographically first username.
pub const PAIR_PROMPT: &str = r#"Based on the following basic information of two users and their tweets, generate a detailed relationship analysis report. The report should be output strictly in the format below and include the specified content. No additional descriptive information is required, just return the JSON data!
The "value" in the output object should match the original language of the content I will give you later. Default is English.
Make the results as rich and comprehensive as possible. When analyzing Green Flags and Red Flags, please analyze multiple small points, controlling between 2 to 6, and determine the specific number based on the situation.

**Output format:**

{
  "mbti": {
    "profile1": "{MBTI1}",
    "profile2": "{MBTI2}"
  },
  "about": "{Description summarizing the overall relationship of the two}",
  "crazy": "{Description of the crazy or unpredictable elements in their relationship}",
  "drama": "{Analysis of potential conflicts or dramatic events in their relationship}",
  "emojis": "{Summary of the relationship's characteristics using appropriate emojis}",
  "divorce": "{Assessment of the likelihood of the relationship breaking up}",
  "marriage": "{Prediction of potential marriage development}",
  "3rd_wheel": "{Analysis of the possibility of a third party involvement}",
  "free_time": "{Description of their hobbies and activities in their free time, and evaluation of how compatible these are}",
  "red_flags": {
    "profile1": ["{Profile1's warning signs that might cause tension in the relationship}"],
    "profile2": ["{Profile2's warning signs that might cause tension in the relationship}"]
  },
  "dealbreaker": "{Description of key factors that could end the relationship}",
  "green_flags": {
    "profile1": ["{Positive elements in the relationship from Profile1}"],
    "profile2": ["{Positive elements in the relationship from Profile2}"]
  },
  "follower_flex": "{Comparison of their social media influence}",
  "risk_appetite": "{Discussion of their risk appetite in life or decisions}",
  "love_languages": "{Analysis of their preferred love languages}",
  "secret_desires": "{Speculation on their hidden needs and desires}",
  "friends_forever": "{Prediction of their performance and longevity in friendship}",
  "jealousy_levels": "{Analysis of their jealousy levels}",
  "attachment_style": "{Description of their attachment styles}",
  "values_alignment": "{Evaluation of their value alignment}",
  "breakup_percentage": "{Percentage chance of a breakup}",
  "overall_compatibility": "{Overall compatibility score}",
  "personality_type_match": "{Compatibility of personality types}",
  "emotional_compatibility": "{Emotional compatibility}",
  "financial_compatibility": "{Financial compatibility}",
  "communication_style_compatibility": "{Consistency of communication styles}"
}
"#;

/// User-content payload for the single-subject reading: the full persisted
/// record, pretty-printed.
pub fn subject_payload(subject: &Subject) -> Result<String> {
    let data =
        serde_json::to_string_pretty(subject).context("Failed to serialize subject for prompt")?;
    Ok(format!("The data follows:\n{}\n", data))
}

/// User-content payload for the compatibility reading. Callers pass the
/// subjects in pair order so profile labels stay stable across runs.
pub fn pair_payload(profile1: &Subject, profile2: &Subject) -> Result<String> {
    let data1 =
        serde_json::to_string_pretty(profile1).context("Failed to serialize first subject")?;
    let data2 =
        serde_json::to_string_pretty(profile2).context("Failed to serialize second subject")?;
    Ok(format!(
        "Profile 1 data:\n{}\n\nProfile 2 data:\n{}\n",
        data1, data2
    ))
}

/// Render stored tweets as the markdown digest fed to the streaming route.
pub fn format_tweets_markdown(tweets: &Value, fallback_author: &str) -> String {
    let Some(list) = tweets.as_array() else {
        return String::new();
    };

    list.iter()
        .map(|tweet| format_tweet(tweet, fallback_author))
        .collect::<Vec<_>>()
        .join("\n---\n\n")
}

fn format_tweet(tweet: &Value, fallback_author: &str) -> String {
    let is_retweet = tweet
        .get("isRetweet")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let retweet_marker = if is_retweet { "RT " } else { "" };
    let author = tweet
        .get("author")
        .and_then(|a| a.get("userName"))
        .and_then(Value::as_str)
        .unwrap_or(fallback_author);
    let created_at = tweet
        .get("createdAt")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let text = tweet.get("text").and_then(Value::as_str).unwrap_or_default();
    let quoted_text = text.split('\n').collect::<Vec<_>>().join("\n> ");

    format!(
        "**{}@{} - {}**\n\n> {}\n\n*retweets: {}, replies: {}, likes: {}, quotes: {}, views: {}*",
        retweet_marker,
        author,
        created_at,
        quoted_text,
        count(tweet, "retweetCount"),
        count(tweet, "replyCount"),
        count(tweet, "likeCount"),
        count(tweet, "quoteCount"),
        count(tweet, "viewCount"),
    )
}

fn count(tweet: &Value, field: &str) -> u64 {
    tweet.get(field).and_then(Value::as_u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pair_payload_labels_profiles_in_argument_order() {
        let alice = Subject::new("alice");
        let bob = Subject::new("bob");
        let payload = pair_payload(&alice, &bob).unwrap();

        let profile1 = payload.find("Profile 1 data:").unwrap();
        let profile2 = payload.find("Profile 2 data:").unwrap();
        assert!(profile1 < profile2);
        assert!(payload[profile1..profile2].contains("alice"));
        assert!(payload[profile2..].contains("bob"));
    }

    #[test]
    fn tweet_markdown_includes_counts_and_quoting() {
        let tweets = json!([
            {
                "text": "first line\nsecond line",
                "createdAt": "2024-08-01",
                "retweetCount": 3,
                "likeCount": 10,
                "author": {"userName": "alice"}
            },
            {
                "text": "a retweet",
                "isRetweet": true,
                "createdAt": "2024-08-02"
            }
        ]);

        let markdown = format_tweets_markdown(&tweets, "fallback");
        assert!(markdown.contains("**@alice - 2024-08-01**"));
        assert!(markdown.contains("> first line\n> second line"));
        assert!(markdown.contains("*retweets: 3, replies: 0, likes: 10, quotes: 0, views: 0*"));
        assert!(markdown.contains("**RT @fallback - 2024-08-02**"));
        assert!(markdown.contains("\n---\n\n"));
    }

    #[test]
    fn tweet_markdown_handles_missing_list() {
        assert_eq!(format_tweets_markdown(&json!(null), "x"), "");
        assert_eq!(format_tweets_markdown(&json!({}), "x"), "");
    }
}
