//! Geometric codecs: point, line, lseg, box, path, polygon, circle.

use bytes::{BufMut, BytesMut};

use super::codec::{format_float, mismatch, utf8, Codec, Reader};
use super::{Circle, Format, Line, Lseg, Path, PgBox, Point, Polygon, TypeMap, Value, ValueKind};
use crate::pg::error::{PgError, PgResult};

/// Which geometric type a [`GeometryCodec`] handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Point,
    Line,
    Lseg,
    Box,
    Path,
    Polygon,
    Circle,
}

#[derive(Debug, Clone, Copy)]
pub struct GeometryCodec {
    pub shape: Shape,
}

impl GeometryCodec {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }

    fn kind(&self) -> ValueKind {
        match self.shape {
            Shape::Point => ValueKind::Point,
            Shape::Line => ValueKind::Line,
            Shape::Lseg => ValueKind::Lseg,
            Shape::Box => ValueKind::Box,
            Shape::Path => ValueKind::Path,
            Shape::Polygon => ValueKind::Polygon,
            Shape::Circle => ValueKind::Circle,
        }
    }
}

fn put_points(buf: &mut BytesMut, points: &[Point]) {
    for p in points {
        buf.put_f64(p.x);
        buf.put_f64(p.y);
    }
}

fn read_point(r: &mut Reader<'_>) -> PgResult<Point> {
    Ok(Point::new(r.f64()?, r.f64()?))
}

fn point_text(p: &Point) -> String {
    format!("({},{})", format_float(p.x), format_float(p.y))
}

fn points_text(points: &[Point]) -> String {
    points.iter().map(point_text).collect::<Vec<_>>().join(",")
}

/// All numbers of a geometric literal, ignoring its punctuation.
fn numbers(s: &str) -> PgResult<Vec<f64>> {
    s.split(|c: char| "()[]{}<>,".contains(c) || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| match t {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            _ => t
                .parse::<f64>()
                .map_err(|e| PgError::Decode(format!("Invalid geometric value {:?}: {}", s, e))),
        })
        .collect()
}

fn pairs(nums: &[f64]) -> Vec<Point> {
    nums.chunks_exact(2).map(|c| Point::new(c[0], c[1])).collect()
}

impl Codec for GeometryCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        kind == self.kind()
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        match format {
            Format::Binary => match (self.shape, value) {
                (Shape::Point, Value::Point(p)) => put_points(buf, &[*p]),
                (Shape::Line, Value::Line(l)) => {
                    buf.put_f64(l.a);
                    buf.put_f64(l.b);
                    buf.put_f64(l.c);
                }
                (Shape::Lseg, Value::Lseg(Lseg(pts))) | (Shape::Box, Value::Box(PgBox(pts))) => {
                    put_points(buf, pts)
                }
                (Shape::Path, Value::Path(path)) => {
                    buf.put_u8(path.closed as u8);
                    buf.put_i32(path.points.len() as i32);
                    put_points(buf, &path.points);
                }
                (Shape::Polygon, Value::Polygon(Polygon(pts))) => {
                    buf.put_i32(pts.len() as i32);
                    put_points(buf, pts);
                }
                (Shape::Circle, Value::Circle(c)) => {
                    put_points(buf, &[c.center]);
                    buf.put_f64(c.radius);
                }
                _ => return Err(mismatch("geometric type", value)),
            },
            Format::Text => {
                let text = match (self.shape, value) {
                    (Shape::Point, Value::Point(p)) => point_text(p),
                    (Shape::Line, Value::Line(l)) => format!(
                        "{{{},{},{}}}",
                        format_float(l.a),
                        format_float(l.b),
                        format_float(l.c)
                    ),
                    (Shape::Lseg, Value::Lseg(Lseg(pts))) => format!("[{}]", points_text(pts)),
                    (Shape::Box, Value::Box(PgBox(pts))) => points_text(pts),
                    (Shape::Path, Value::Path(path)) if path.closed => {
                        format!("({})", points_text(&path.points))
                    }
                    (Shape::Path, Value::Path(path)) => format!("[{}]", points_text(&path.points)),
                    (Shape::Polygon, Value::Polygon(Polygon(pts))) => {
                        format!("({})", points_text(pts))
                    }
                    (Shape::Circle, Value::Circle(c)) => format!(
                        "<{},{}>",
                        point_text(&c.center),
                        format_float(c.radius)
                    ),
                    _ => return Err(mismatch("geometric type", value)),
                };
                buf.put_slice(text.as_bytes());
            }
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        match format {
            Format::Binary => {
                let mut r = Reader::new(src, "geometric");
                let value = match self.shape {
                    Shape::Point => Value::Point(read_point(&mut r)?),
                    Shape::Line => Value::Line(Line {
                        a: r.f64()?,
                        b: r.f64()?,
                        c: r.f64()?,
                    }),
                    Shape::Lseg => Value::Lseg(Lseg([read_point(&mut r)?, read_point(&mut r)?])),
                    Shape::Box => Value::Box(PgBox([read_point(&mut r)?, read_point(&mut r)?])),
                    Shape::Path => {
                        let closed = r.u8()? != 0;
                        let n = r.i32()?.max(0);
                        let points = (0..n).map(|_| read_point(&mut r)).collect::<PgResult<_>>()?;
                        Value::Path(Path { points, closed })
                    }
                    Shape::Polygon => {
                        let n = r.i32()?.max(0);
                        let points = (0..n).map(|_| read_point(&mut r)).collect::<PgResult<_>>()?;
                        Value::Polygon(Polygon(points))
                    }
                    Shape::Circle => Value::Circle(Circle {
                        center: read_point(&mut r)?,
                        radius: r.f64()?,
                    }),
                };
                r.finish()?;
                Ok(value)
            }
            Format::Text => {
                let s = utf8(src, "geometric")?.trim();
                let nums = numbers(s)?;
                let malformed =
                    || PgError::Decode(format!("Invalid {:?} literal {:?}", self.shape, s));
                let expect = |n: usize| if nums.len() == n { Ok(()) } else { Err(malformed()) };
                Ok(match self.shape {
                    Shape::Point => {
                        expect(2)?;
                        Value::Point(Point::new(nums[0], nums[1]))
                    }
                    Shape::Line => {
                        expect(3)?;
                        Value::Line(Line {
                            a: nums[0],
                            b: nums[1],
                            c: nums[2],
                        })
                    }
                    Shape::Lseg | Shape::Box => {
                        expect(4)?;
                        let pts = [Point::new(nums[0], nums[1]), Point::new(nums[2], nums[3])];
                        if self.shape == Shape::Lseg {
                            Value::Lseg(Lseg(pts))
                        } else {
                            Value::Box(PgBox(pts))
                        }
                    }
                    Shape::Path => {
                        if nums.len() % 2 != 0 {
                            return Err(malformed());
                        }
                        Value::Path(Path {
                            points: pairs(&nums),
                            closed: !s.starts_with('['),
                        })
                    }
                    Shape::Polygon => {
                        if nums.len() % 2 != 0 {
                            return Err(malformed());
                        }
                        Value::Polygon(Polygon(pairs(&nums)))
                    }
                    Shape::Circle => {
                        expect(3)?;
                        Value::Circle(Circle {
                            center: Point::new(nums[0], nums[1]),
                            radius: nums[2],
                        })
                    }
                })
            }
        }
    }
}
