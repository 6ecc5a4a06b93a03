//! Parsers for the instrument's text responses and binary block headers.

use nom::branch::alt;
use nom::bytes::complete::{tag, take, take_while, take_while1};
use nom::character::complete::{char, one_of, space0, space1};
use nom::combinator::{all_consuming, map_res, opt};
use nom::number::complete::double;
use nom::sequence::{preceded, terminated, tuple};
use nom::IResult;

fn is_header_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ':' || c == '*' || c == '?'
}

fn is_unit_char(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '/' || c == '%'
}

/// `C1:VDIV ` style header in front of a value.
fn header(input: &str) -> IResult<&str, &str> {
    terminated(take_while1(is_header_char), space1)(input)
}

fn value_with_unit(input: &str) -> IResult<&str, f64> {
    terminated(double, tuple((space0, take_while(is_unit_char), space0)))(input)
}

/// Reads the number out of a reply such as `C1:VDIV 5.00E-01V`,
/// `SARA 1.00E+09Sa/s`, `SANU 1.40E+07pts` or a bare `2.5E-02`.
pub fn scpi_value(response: &str) -> Option<f64> {
    let trimmed = response.trim();
    let parsed: IResult<&str, f64> = all_consuming(alt((
        preceded(header, value_with_unit),
        value_with_unit,
    )))(trimmed);
    parsed.ok().map(|(_, value)| value)
}

/// Parses an IEEE 488.2 definite-length block header `#<d><d digits>` and
/// returns the payload length.
pub fn block_header(input: &[u8]) -> IResult<&[u8], usize> {
    let (rest, digits) = block_width(input)?;
    let width = digits.to_digit(10).unwrap_or(0) as usize;
    map_res(take(width), |len: &[u8]| {
        std::str::from_utf8(len)
            .map_err(|_| ())
            .and_then(|s| s.parse::<usize>().map_err(|_| ()))
    })(rest)
}

fn block_width(input: &[u8]) -> IResult<&[u8], char> {
    preceded(tag("#"), one_of("123456789"))(input)
}

/// Identity reply `maker,model,serial,firmware`; only the model is required.
pub fn identity(response: &str) -> Option<(String, String)> {
    let parsed: IResult<&str, (&str, &str)> = tuple((
        terminated(take_while1(|c: char| c != ','), char(',')),
        terminated(take_while1(|c: char| c != ','), opt(char(','))),
    ))(response.trim());
    parsed
        .ok()
        .map(|(_, (maker, model))| (maker.trim().to_string(), model.trim().to_string()))
}
